use std::env;
use std::time::Duration;

use gcs_client::gcs_array::save_gcs_array;
use gcs_client::{init_defaults, GcsDevice, TraceAddress};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_defaults()?;

    // RUST_LOG=debug shows the GCS send/recv lines
    env_logger::init();

    let addr = env::var("GCS_ADDR").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = env::var("GCS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(50000);
    let out = env::var("GCS_OUT").unwrap_or_else(|_| "capture.dat".into());

    let mut dev = GcsDevice::connect_tcp(&addr, port).await?;
    println!("{} ({})", dev.qidn().await?.trim(), dev.dialect());
    let axes = dev.axes().await?;

    let recorder_id = if dev.dialect() == gcs_client::Dialect::Gcs30 {
        Some("REC_1")
    } else {
        None
    };
    let traces: Vec<TraceAddress> = axes
        .iter()
        .take(2)
        .map(|a| {
            if recorder_id.is_some() {
                TraceAddress::new(a, "-", "0x102")
            } else {
                TraceAddress::new(a, "2", "-")
            }
        })
        .collect::<Result<_, _>>()?;

    let mut rec = dev.recorder(recorder_id).await?;
    rec.set_traces(traces)?;
    rec.set_number_of_values(1000)?;
    rec.arm().await?;
    let capture = rec.read(Duration::from_secs(10)).await?;
    save_gcs_array(&out, &capture.header.items, &capture.data)?;
    println!("wrote {} x {} values to {out}", capture.data.len(), capture.data.first().map_or(0, Vec::len));

    Ok(())
}
