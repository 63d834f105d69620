mod common;

use common::{device, start_mock};
use gcs_client::{Dialect, GcsError};
use gcs_mock::Profile;

#[tokio::test]
async fn gcs2_controller_is_detected() -> Result<(), GcsError> {
    let (_mock, port) = start_mock(Profile::gcs2()).await;
    let mut dev = device(port).await;
    assert_eq!(dev.dialect(), Dialect::Undetermined);

    assert_eq!(dev.devname().await?, "E-727");
    assert_eq!(dev.dialect(), Dialect::Gcs2);
    assert_eq!(dev.axes().await?, ["1", "2", "3"]);
    assert!(dev.has("DRR?").await?);
    assert!(dev.has("#5").await?);
    assert!(!dev.has("REC START").await?);
    Ok(())
}

#[tokio::test]
async fn gcs30_controller_is_detected() -> Result<(), GcsError> {
    let (_mock, port) = start_mock(Profile::gcs30()).await;
    let mut dev = device(port).await;
    assert_eq!(dev.detect().await?, Dialect::Gcs30);
    assert_eq!(dev.devname().await?, "C-4000.M1");
    assert_eq!(dev.axes().await?, ["AXIS_1", "AXIS_2"]);
    assert!(dev.has("REC START").await?);
    assert!(dev.has("REC").await?);
    assert!(!dev.has("DRR?").await?);
    Ok(())
}

#[tokio::test]
async fn identification_decides_without_syntax_version() -> Result<(), GcsError> {
    let profile = Profile {
        syntax_version: None,
        ..Profile::gcs30()
    };
    let (_mock, port) = start_mock(profile).await;
    let mut dev = device(port).await;
    // CSV? times out and leaves an unknown-command error behind
    assert_eq!(dev.detect().await?, Dialect::Gcs30);
    Ok(())
}

#[tokio::test]
async fn device_errors_carry_the_dialect() {
    let (mock, port) = start_mock(Profile::gcs2()).await;
    let mut dev = device(port).await;
    dev.detect().await.expect("detect");
    mock.set_error(10);
    let err = dev.send("MOV 1 0.5").await.expect_err("pending error");
    assert_eq!(err.device_code(), Some(10));
    assert!(matches!(err, GcsError::Device { dialect: Dialect::Gcs2, .. }));
    // the error query cleared it
    dev.send("MOV 1 0.5").await.expect("clean");
}
