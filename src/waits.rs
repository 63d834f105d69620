//! Polling helpers that wait for a controller state.
//!
//! Every helper sleeps `predelay`, polls its query every `polldelay` until
//! the condition holds or `timeout` elapsed, then sleeps `postdelay`.
//! Motion waits stop all axes before reporting a timeout.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::config as global_config;
use crate::device::GcsDevice;
use crate::error::{GcsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub polldelay: Duration,
    pub predelay: Duration,
    pub postdelay: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        let cfg = global_config();
        Self {
            timeout: Duration::from_secs(cfg.gcs_wait_timeout_secs),
            polldelay: Duration::from_millis(cfg.gcs_poll_delay_ms),
            predelay: Duration::ZERO,
            postdelay: Duration::ZERO,
        }
    }
}

impl WaitOptions {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_polldelay(mut self, polldelay: Duration) -> Self {
        self.polldelay = polldelay;
        self
    }

    #[must_use]
    pub const fn with_predelay(mut self, predelay: Duration) -> Self {
        self.predelay = predelay;
        self
    }

    #[must_use]
    pub const fn with_postdelay(mut self, postdelay: Duration) -> Self {
        self.postdelay = postdelay;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnTimeout {
    Raise,
    StopAll,
}

async fn poll_until<F>(
    dev: &mut GcsDevice,
    opts: &WaitOptions,
    what: &str,
    on_timeout: OnTimeout,
    mut done: F,
) -> Result<()>
where
    F: for<'d> FnMut(&'d mut GcsDevice) -> crate::connection::BoxFuture<'d, Result<bool>>,
{
    if !opts.predelay.is_zero() {
        sleep(opts.predelay).await;
    }
    let deadline = Instant::now() + opts.timeout;
    loop {
        if done(dev).await? {
            break;
        }
        if Instant::now() >= deadline {
            if on_timeout == OnTimeout::StopAll {
                tracing::warn!(what, "wait timed out, stopping all axes");
                dev.stop_all(true).await?;
            }
            return Err(GcsError::WaitTimeout(format!(
                "{what} not reached within {:?}",
                opts.timeout
            )));
        }
        sleep(opts.polldelay).await;
    }
    if !opts.postdelay.is_zero() {
        sleep(opts.postdelay).await;
    }
    Ok(())
}

/// Wait until the controller accepts commands again.
pub async fn wait_on_ready(dev: &mut GcsDevice, opts: &WaitOptions) -> Result<()> {
    poll_until(dev, opts, "controller ready", OnTimeout::Raise, |d| {
        Box::pin(d.is_controller_ready())
    })
    .await
}

/// Wait until `axes` (all when empty) are on target.
pub async fn wait_on_target(dev: &mut GcsDevice, axes: &[String], opts: &WaitOptions) -> Result<()> {
    let axes = axes.to_vec();
    poll_until(dev, opts, "on target", OnTimeout::StopAll, move |d| {
        let axes = axes.clone();
        Box::pin(async move { Ok(d.on_target(&axes).await?.values().all(|v| *v)) })
    })
    .await
}

/// Wait until `axes` (all when empty) are referenced.
pub async fn wait_on_referencing(
    dev: &mut GcsDevice,
    axes: &[String],
    opts: &WaitOptions,
) -> Result<()> {
    let axes = axes.to_vec();
    poll_until(dev, opts, "referenced", OnTimeout::StopAll, move |d| {
        let axes = axes.clone();
        Box::pin(async move { Ok(d.referenced(&axes).await?.values().all(|v| *v)) })
    })
    .await
}

/// Wait until no macro is running.
pub async fn wait_on_macro(dev: &mut GcsDevice, opts: &WaitOptions) -> Result<()> {
    poll_until(dev, opts, "macro finished", OnTimeout::Raise, |d| {
        Box::pin(async move { Ok(!d.is_running_macro().await?) })
    })
    .await
}

/// Stop all axes, ignoring the stop error, and wait until the controller
/// is ready again.
pub async fn stop_all(dev: &mut GcsDevice, opts: &WaitOptions) -> Result<()> {
    dev.stop_all(true).await?;
    wait_on_ready(dev, opts).await
}
