//! ---
//! iaq_section: "05-instrument-link"
//! iaq_subsection: "tests"
//! iaq_type: "test"
//! iaq_scope: "code"
//! iaq_description: "Behavioural tests for the scripted instrument link."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::time::Duration;

use iaq_common::config::{ChannelTable, TransportConfig};
use iaq_common::telemetry::Channel;
use iaq_link::{InstrumentLink, LinkError, ScriptedLink};

fn scripted() -> (ScriptedLink, iaq_link::ScriptHandle) {
    ScriptedLink::new(ChannelTable::default().register_layout().unwrap().unwrap())
}

#[tokio::test]
async fn open_follows_the_script_then_succeeds() {
    let (mut link, handle) = scripted();
    handle.fail_open_times(2);
    let settings = TransportConfig::default();

    assert!(link.open(&settings).await.is_err());
    assert!(link.open(&settings).await.is_err());
    link.open(&settings).await.unwrap();
    assert!(link.is_open());
    assert_eq!(handle.open_attempts(), 3);
    assert_eq!(link.descriptor().as_deref(), Some("/dev/ttyACM0:1"));

    // Already open: no new attempt recorded.
    link.open(&settings).await.unwrap();
    assert_eq!(handle.open_attempts(), 3);
}

#[tokio::test]
async fn reads_return_the_register_bank() {
    let (mut link, handle) = scripted();
    handle.set_registers(61, &[650, 725, 2590, 5347, 1]);
    link.open(&TransportConfig::default()).await.unwrap();

    let block = link.read_channels().await.unwrap();
    assert_eq!(block.raw(Channel::Co2), Some(725));
    assert_eq!(block.raw(Channel::VolatileCompounds), Some(1));
    assert_eq!(handle.reads(), 1);
}

#[tokio::test]
async fn connection_loss_closes_the_session() {
    let (mut link, handle) = scripted();
    link.open(&TransportConfig::default()).await.unwrap();

    handle.push_read_failure(LinkError::Protocol("bad crc".into()));
    handle.push_read_failure(LinkError::ConnectionReset("unplugged".into()));

    assert_eq!(link.read_channels().await.unwrap_err().kind(), "protocol");
    assert!(link.is_open());
    assert!(link.read_channels().await.unwrap_err().is_connection_loss());
    assert!(!link.is_open());
    assert_eq!(link.read_channels().await.unwrap_err(), LinkError::NotOpen);
}

#[tokio::test(start_paused = true)]
async fn read_delay_is_observable_with_timeouts() {
    let (mut link, handle) = scripted();
    link.open(&TransportConfig::default()).await.unwrap();
    handle.set_read_delay(Some(Duration::from_secs(10)));

    let outcome = tokio::time::timeout(Duration::from_secs(5), link.read_channels()).await;
    assert!(outcome.is_err());
}

#[tokio::test(start_paused = true)]
async fn cancelled_open_leaves_the_link_closed() {
    let (mut link, handle) = scripted();
    handle.set_open_delay(Some(Duration::from_secs(10)));
    let settings = TransportConfig::default();

    let outcome = tokio::time::timeout(Duration::from_secs(5), link.open(&settings)).await;
    assert!(outcome.is_err());
    assert!(!link.is_open());
    assert_eq!(handle.open_attempts(), 1);

    handle.set_open_delay(None);
    link.open(&settings).await.unwrap();
    assert!(link.is_open());
    assert_eq!(handle.open_attempts(), 2);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (mut link, handle) = scripted();
    link.open(&TransportConfig::default()).await.unwrap();
    link.close().await.unwrap();
    link.close().await.unwrap();
    assert!(!handle.is_open());
    assert_eq!(handle.closes(), 2);
}
