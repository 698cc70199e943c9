//! Building the driver through `DriverFactory`.

mod common;

use common::FakeXhServer;
use daq_core::capabilities::DeviceCategory;
use daq_core::driver::{Capability, DriverFactory};
use daq_driver_xh::XhFactory;
use serde_json::json;

#[tokio::test]
async fn build_connects_and_exposes_every_capability() {
    let server = FakeXhServer::start(32).await;
    let factory = XhFactory;
    let config = server.config();

    factory.validate(&config).unwrap();
    let components = factory.build(config).await.unwrap();

    assert_eq!(components.category, Some(DeviceCategory::Detector));
    let mut caps = components.capabilities();
    caps.sort_by_key(|c| c.name());
    let mut expected = factory.capabilities().to_vec();
    expected.sort_by_key(|c| c.name());
    assert_eq!(caps, expected);

    let info = components.detector_info.as_ref().unwrap();
    assert_eq!(info.detector_type(), "xh");
    assert_eq!(info.max_image_size().width, 32);

    let producer = components.frame_producer.as_ref().unwrap();
    assert_eq!(producer.resolution(), (32, 1));

    let commands = components.commandable.as_ref().unwrap();
    let reply = commands
        .execute_command("get_temperature", json!({ "value": 1 }))
        .await
        .unwrap();
    assert_eq!(reply["value"], 21.5);
    assert!(server
        .commands()
        .contains(&"xstrip tc get 'xh0' ch 1 t".to_string()));

    assert!(components
        .capabilities()
        .contains(&Capability::AcquisitionControl));
}

#[tokio::test]
async fn build_fails_without_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut table = toml::Table::new();
    table.insert("host".into(), toml::Value::String("127.0.0.1".into()));
    table.insert("port".into(), toml::Value::Integer(i64::from(port)));
    let config = toml::Value::Table(table);
    let err = XhFactory.build(config).await.err().unwrap();
    assert!(format!("{err:#}").contains("Failed to initialize Xh detector"));
}
