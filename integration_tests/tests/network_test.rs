use std::time::Duration;

use assertables::assert_contains;
use integration_tests::sim_device::SimDevice;
use opencan_client::{BusError, Network, NetworkError};
use opencan_common::CanId;

mod utils;
use utils::{setup, BusLogger};

#[tokio::test]
async fn test_search_finds_devices() {
    let (sim, bus) = setup();
    let _logger = BusLogger::new(&sim);
    let devices: Vec<_> = [3u8, 1, 12]
        .into_iter()
        .map(|id| {
            SimDevice::new(id)
                .with_object(0x1000, 0, &[0x91, 0x01, 0, 0])
                .spawn(&sim)
        })
        .collect();
    let mut network = Network::new(bus);
    network.run();

    let mut found = network.search(10, Duration::from_millis(100)).await.unwrap();
    found.sort_unstable();
    assert_eq!(vec![1, 3], found);

    // Node 12 is past the limit, and only answers a wider search
    let found = network.search(11, Duration::from_millis(100)).await.unwrap();
    assert_eq!(3, found.len());
    assert_contains!(found, &devices[2].node_id());
}

#[tokio::test]
async fn test_search_counts_any_node_traffic() {
    let (sim, bus) = setup();
    // A device without the device type object answers with an abort, which still counts
    let _silent = SimDevice::new(5).spawn(&sim);
    let mut device = SimDevice::new(40).spawn(&sim);
    let mut network = Network::new(bus);
    network.run();

    let search = network.search(6, Duration::from_millis(100));
    let pdo = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        device.send(CanId::std(0x180 + 40), &[1, 2]).await;
    };
    let (found, _) = tokio::join!(search, pdo);
    assert_eq!(vec![5, 40], found.unwrap());
}

#[tokio::test]
async fn test_search_requires_running_bus() {
    let (_sim, bus) = setup();
    bus.stop().await;
    let network = Network::new(bus);
    assert!(matches!(
        network.search(5, Duration::from_millis(10)).await,
        Err(NetworkError::Bus {
            source: BusError::NotRunning
        })
    ));
}

#[tokio::test]
async fn test_nodes_are_independent() {
    let (sim, bus) = setup();
    let _device_a = SimDevice::new(1)
        .with_object(0x2000, 0, &[0x11, 0, 0, 0])
        .spawn(&sim);
    let _device_b = SimDevice::new(2)
        .with_object(0x2000, 0, &[0x22, 0, 0, 0])
        .spawn(&sim);

    let schema = opencan_eds::parse_eds(
        "[2000]\nParameterName=Value\nObjectType=0x7\nDataType=0x0007\nAccessType=rw\nDefaultValue=0\n",
    )
    .unwrap();
    let mut network = Network::new(bus);
    network.run();
    network.add_node(1, &schema).unwrap();
    network.add_node(2, &schema).unwrap();

    assert_eq!(
        vec![0x11, 0, 0, 0],
        network.node_mut(1).unwrap().read(0x2000, 0).await.unwrap()
    );
    network
        .node_mut(2)
        .unwrap()
        .write(0x2000, 0, &[0x33])
        .await
        .unwrap();

    let value = |id: u8| {
        network
            .node(id)
            .unwrap()
            .variable(0x2000, 0)
            .unwrap()
            .data
            .clone()
    };
    assert_eq!(vec![0x11, 0, 0, 0], value(1));
    assert_eq!(vec![0x33], value(2));
    // The schema is untouched
    assert_eq!(Some(0), schema.variable(0x2000, 0).unwrap().get_uint_val());

    assert!(matches!(
        network.node(3),
        Err(NetworkError::NoSuchNode { node_id: 3 })
    ));
}
