#![allow(dead_code)]

use std::time::Duration;

use gcs_client::{Connection, GcsDevice, TcpGateway};
use gcs_mock::{MockController, Profile};

/// Start a mock controller on an ephemeral port.
pub async fn start_mock(profile: Profile) -> (MockController, u16) {
    let server = MockController::new(profile);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let srv = server.clone();
    tokio::spawn(async move {
        let _ = srv.run_listener_on(listener).await;
    });
    // give the server a moment to start
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, port)
}

/// Undetected device with a short answer timeout.
pub async fn device(port: u16) -> GcsDevice {
    let gw = TcpGateway::connect("127.0.0.1", port).await.expect("connect");
    GcsDevice::new(Connection::new(gw).with_timeout(Duration::from_millis(500)))
}
