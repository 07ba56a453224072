use std::time::Duration;

use assertables::{assert_ge, assert_lt};
use integration_tests::sim_device::SimDevice;
use opencan_client::{SdoClient, SdoClientError, SdoSettings};
use opencan_common::{sdo::AbortCode, CanId};

mod utils;
use utils::{node_id, setup, BusLogger};

const DEVICE_NAME: &[u8] = b"opencan test node";

#[tokio::test]
async fn test_expedited_round_trip() {
    let (sim, bus) = setup();
    let _logger = BusLogger::new(&sim);
    let device = SimDevice::new(1)
        .with_object(0x2000, 1, &[0, 0, 0, 0])
        .spawn(&sim);
    let client = SdoClient::new_std(node_id(1), bus);

    client
        .download(0x2000, 1, &[0xa, 0xb, 0xc], false)
        .await
        .unwrap();
    assert_eq!(Some(vec![0xa, 0xb, 0xc]), device.object(0x2000, 1));
    assert_eq!(vec![0xa, 0xb, 0xc], client.upload(0x2000, 1).await.unwrap());

    client.download_u16(0x2000, 1, 0x1234).await.unwrap();
    assert_eq!(0x1234, client.upload_u16(0x2000, 1).await.unwrap());
}

#[tokio::test]
async fn test_segmented_upload() {
    let (sim, bus) = setup();
    let _logger = BusLogger::new(&sim);
    let _device = SimDevice::new(3)
        .with_object(0x1008, 0, DEVICE_NAME)
        .spawn(&sim);
    let client = SdoClient::new_std(node_id(3), bus);

    assert_eq!(DEVICE_NAME, client.upload(0x1008, 0).await.unwrap());

    // One initiate request and three segment requests
    let requests = sim
        .history()
        .iter()
        .filter(|msg| msg.id() == CanId::std(0x603))
        .count();
    assert_eq!(4, requests);

    assert_eq!(
        "opencan test node",
        client.upload_string(0x1008, 0).await.unwrap()
    );
}

#[tokio::test]
async fn test_toggle_mismatch_aborts() {
    let (sim, bus) = setup();
    let _logger = BusLogger::new(&sim);
    let device = SimDevice::new(3)
        .with_object(0x1008, 0, DEVICE_NAME)
        .with_corrupt_toggle()
        .spawn(&sim);
    let client = SdoClient::new_std(node_id(3), bus);

    assert_eq!(
        Err(SdoClientError::ToggleNotAlternated {
            index: 0x1008,
            sub: 0
        }),
        client.upload(0x1008, 0).await
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        vec![AbortCode::ToggleNotAlternated as u32],
        device.aborts_received()
    );
}

#[tokio::test]
async fn test_server_abort() {
    let (sim, bus) = setup();
    let _device = SimDevice::new(2).spawn(&sim);
    let client = SdoClient::new_std(node_id(2), bus);

    assert_eq!(
        Err(SdoClientError::ServerAbort {
            index: 0x2000,
            sub: 0,
            abort_code: AbortCode::NoSuchObject as u32,
        }),
        client.upload(0x2000, 0).await
    );
    assert!(matches!(
        client.download(0x2000, 0, &[1], false).await,
        Err(SdoClientError::ServerAbort { .. })
    ));
}

#[tokio::test]
async fn test_segmented_download_rejected() {
    let (sim, bus) = setup();
    let device = SimDevice::new(2)
        .with_object(0x2000, 0, &[0])
        .spawn(&sim);
    let client = SdoClient::new_std(node_id(2), bus);

    assert_eq!(
        Err(SdoClientError::SegmentedDownloadUnsupported { len: 5 }),
        client.download(0x2000, 0, &[1, 2, 3, 4, 5], false).await
    );
    assert!(matches!(
        client.download(0x2000, 0, &[1], true).await,
        Err(SdoClientError::SegmentedDownloadUnsupported { .. })
    ));
    assert!(sim.history().is_empty());
    assert_eq!(Some(vec![0]), device.object(0x2000, 0));
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_timeout() {
    let (sim, bus) = setup();
    let client = SdoClient::with_settings(
        node_id(9),
        bus,
        SdoSettings {
            timeout_ms: 50,
            retries: 3,
        },
    );

    let start = tokio::time::Instant::now();
    assert_eq!(Err(SdoClientError::NoResponse), client.upload(0x1000, 0).await);
    // 50 + 100 + 200ms
    assert_ge!(start.elapsed(), Duration::from_millis(350));
    assert_eq!(3, sim.history().len());
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_answers_on_retry() {
    let (sim, bus) = setup();
    let _device = SimDevice::new(4)
        .with_object(0x1000, 0, &[0x91, 0x01, 0x00, 0x00])
        .with_response_delay(Duration::from_millis(80))
        .spawn(&sim);
    let client = SdoClient::with_settings(
        node_id(4),
        bus,
        SdoSettings {
            timeout_ms: 50,
            retries: 3,
        },
    );

    // The first response arrives during the second, longer wait
    assert_eq!(0x191, client.upload_u32(0x1000, 0).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_same_node_transfers_are_serialized() {
    let (sim, bus) = setup();
    let _device = SimDevice::new(5)
        .with_object(0x2000, 1, &[1])
        .with_object(0x2000, 2, &[2])
        .with_response_delay(Duration::from_millis(40))
        .spawn(&sim);
    let client = SdoClient::new_std(node_id(5), bus);
    let other = client.clone();

    let start = tokio::time::Instant::now();
    let (a, b) = tokio::join!(client.upload(0x2000, 1), other.upload(0x2000, 2));
    assert_eq!(vec![1], a.unwrap());
    assert_eq!(vec![2], b.unwrap());
    assert_ge!(start.elapsed(), Duration::from_millis(80));

    // Requests and responses strictly alternate
    let ids: Vec<u32> = sim.history().iter().map(|msg| msg.id().raw()).collect();
    assert_eq!(vec![0x605, 0x585, 0x605, 0x585], ids);
}

#[tokio::test(start_paused = true)]
async fn test_different_nodes_overlap() {
    let (sim, bus) = setup();
    let _device_a = SimDevice::new(6)
        .with_object(0x2000, 0, &[6])
        .with_response_delay(Duration::from_millis(40))
        .spawn(&sim);
    let _device_b = SimDevice::new(7)
        .with_object(0x2000, 0, &[7])
        .with_response_delay(Duration::from_millis(40))
        .spawn(&sim);
    let client_a = SdoClient::new_std(node_id(6), bus.clone());
    let client_b = SdoClient::new_std(node_id(7), bus);

    let start = tokio::time::Instant::now();
    let (a, b) = tokio::join!(client_a.upload(0x2000, 0), client_b.upload(0x2000, 0));
    assert_eq!(vec![6], a.unwrap());
    assert_eq!(vec![7], b.unwrap());
    assert_lt!(start.elapsed(), Duration::from_millis(80));
}
