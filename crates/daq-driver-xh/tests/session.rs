//! Session tests against the fake Xh server over real TCP sockets.

mod common;

use common::FakeXhServer;
use daq_core::data::ImageType;
use daq_driver_xh::hardware::HvMonitor;
use daq_driver_xh::{XhConfig, XhError, XhSession};

async fn connected(server: &FakeXhServer) -> XhSession {
    let session = XhSession::new(XhConfig::new("127.0.0.1", server.port()));
    session.init().await.expect("init against fake server");
    session
}

#[tokio::test]
async fn init_opens_detector_and_reads_pixels() {
    let server = FakeXhServer::start(16).await;
    let session = connected(&server).await;

    assert!(session.is_connected().await);
    assert_eq!(session.npixels(), 16);
    assert_eq!(session.max_image_size().width, 16);
    assert_eq!(session.trig_mux(), 9);
    assert_eq!(session.nb_scans(), 1);

    let commands = server.commands();
    assert!(commands[0].starts_with("port "));
    assert_eq!(commands[1], "xstrip open 'xh0'");
    assert_eq!(commands[2], "unif-get-nx 3");
    assert!(server.data_port().is_some());
}

#[tokio::test]
async fn init_runs_config_script() {
    let server = FakeXhServer::start(8).await;
    let mut config = XhConfig::new("127.0.0.1", server.port());
    config.config_name = Some("config_xh".into());
    config.uninterleave = true;

    let session = XhSession::new(config);
    session.init().await.unwrap();

    let commands = server.commands();
    assert_eq!(commands[1], "~config_xh");
    assert_eq!(commands[2], "xstrip open 'xh0' un-interleave");
}

#[tokio::test]
async fn failed_open_is_device_error() {
    let server = FakeXhServer::start(8).await;
    server.reply_to("xstrip open", "! no such system\n* -1\n");

    let session = XhSession::new(XhConfig::new("127.0.0.1", server.port()));
    match session.init().await {
        Err(XhError::Device(msg)) => assert!(msg.contains("no such system")),
        other => panic!("expected device error, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_refused_is_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let session = XhSession::new(XhConfig::new("127.0.0.1", port));
    assert!(matches!(session.init().await, Err(XhError::Connection(_))));
}

#[tokio::test]
async fn prepare_without_exposure_checks_configured_frames() {
    let server = FakeXhServer::start(8).await;
    let session = connected(&server).await;
    session.set_nb_frames(5);
    server.set_total_frames(4);

    assert!(matches!(
        session.prepare_acquisition().await,
        Err(XhError::Configuration(_))
    ));

    server.set_total_frames(5);
    session.prepare_acquisition().await.unwrap();
    assert!(server
        .commands_starting_with("xstrip timing setup-group")
        .is_empty());
}

#[tokio::test]
async fn prepare_with_uneven_groups_sends_nothing() {
    let server = FakeXhServer::start(8).await;
    let session = connected(&server).await;
    let before = server.commands().len();

    session.set_exposure(1.0).unwrap();
    session.set_nb_frames(7);
    session.set_nb_groups(2).unwrap();
    assert!(matches!(
        session.prepare_acquisition().await,
        Err(XhError::Configuration(_))
    ));
    assert_eq!(server.commands().len(), before);
}

#[tokio::test]
async fn readout_mode_and_frame_read() {
    let server = FakeXhServer::start(4).await;
    let session = connected(&server).await;

    session.set_16bit_readout(true).await.unwrap();
    assert_eq!(session.image_type(), ImageType::Bpp16);

    let data = session.read_frames(2, 1).await.unwrap();
    assert_eq!(data.len(), 4 * 2);
    assert_eq!(u16::from_be_bytes([data[2], data[3]]), common::sample(2, 1) as u16);

    let commands = server.commands();
    assert!(commands.contains(&"xstrip mode16bit 'xh0' 1".to_string()));
    assert!(commands.contains(&"read 0 0 2 4 1 1 from 3 raw".to_string()));
}

#[tokio::test]
async fn uninterleave_reopens_detector() {
    let server = FakeXhServer::start(8).await;
    let session = connected(&server).await;

    session.set_uninterleave(true).await.unwrap();
    session.set_uninterleave(true).await.unwrap();
    assert!(session.uninterleave());

    session.read_frames(0, 1).await.unwrap();
    let commands = server.commands();
    assert!(commands.contains(&"close 3".to_string()));
    assert_eq!(
        server.commands_starting_with("xstrip open").len(),
        2,
        "a repeated request must not reopen"
    );
    assert!(commands.contains(&"read 0 0 0 4 2 1 from 3 long".to_string()));
}

#[tokio::test]
async fn monitor_and_script_commands() {
    let server = FakeXhServer::start(8).await;
    let mut config = XhConfig::new("127.0.0.1", server.port());
    config.timing_scripts = vec!["timing_fast".into()];
    let session = XhSession::new(config);
    session.init().await.unwrap();

    assert_eq!(session.get_temperature(2).await.unwrap(), 21.5);
    assert_eq!(session.get_bias().await.unwrap(), 21.5);
    assert_eq!(
        session
            .get_hv_adc(Some(HvMonitor::Hv), None, false)
            .await
            .unwrap(),
        21.5
    );
    assert_eq!(session.timing_script().await.unwrap(), "timing.xh");
    assert_eq!(session.list_available_caps().await.unwrap().values, vec![0, 1, 2, 4, 8]);

    session.run_timing_script("timing_fast").await.unwrap();
    assert!(session.run_timing_script("timing_slow").await.is_err());
    session.cool_down().await.unwrap();
    session.power_down().await.unwrap();

    let commands = server.commands();
    for expected in [
        "xstrip tc get 'xh0' ch 2 t",
        "xstrip hv get-adc 'xh0' ibias",
        "~timing_fast",
        "~head_powerdown",
        "~cooldown_xh",
    ] {
        assert!(commands.contains(&expected.to_string()), "missing {expected}");
    }
    assert!(!commands.contains(&"~timing_slow".to_string()));
}

#[tokio::test]
async fn shutdown_then_commands_fail() {
    let server = FakeXhServer::start(8).await;
    let session = connected(&server).await;

    session.shutdown().await;
    assert!(!session.is_connected().await);
    assert!(matches!(
        session.start_timing().await,
        Err(XhError::NotConnected)
    ));
}
