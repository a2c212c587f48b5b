use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serial_test::serial;

use callbridge::prelude::*;

struct SilentAccounting;

#[async_trait]
impl AccountingSystem for SilentAccounting {
    async fn is_reachable(&self) -> bool {
        true
    }

    async fn new_call(&self, _call: &CallData) -> Result<(), AccountingError> {
        Ok(())
    }

    async fn call_state_changed(&self, _call: &CallData, _state: CallState) -> Result<(), AccountingError> {
        Ok(())
    }

    async fn contact_assignment_changed(&self, _call: &CallData) -> Result<(), AccountingError> {
        Ok(())
    }

    async fn new_journal_entry(&self, _call: &CallData, _note: &str) -> Result<(), AccountingError> {
        Ok(())
    }
}

#[tokio::test]
#[serial]
async fn test_prelude_builds_a_socket_bridge() -> anyhow::Result<()> {
    setup_logging(LoggingConfig::default())?;

    let socket = Arc::new(SocketTransport::new(SocketConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    }));
    let processor = CallEventProcessor::builder(BridgeConfig::default(), Arc::new(SilentAccounting))
        .transport(socket.clone())
        .build()?;

    let running = tokio::spawn({
        let processor = processor.clone();
        async move { processor.run().await }
    });

    for _ in 0..100 {
        if socket.local_addr().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(socket.local_addr().is_some());
    assert!(matches!(
        processor.dial("0891112222", "S1", None).await,
        Err(BridgeError::NoActiveTransport)
    ));

    processor.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running).await???;
    Ok(())
}

#[test]
#[serial]
fn test_logging_setup_is_repeatable() {
    let config = LoggingConfig::new(callbridge::infra_common::parse_log_level("debug").unwrap(), "callbridge-test");
    assert!(setup_logging(config.clone()).is_ok());
    assert!(setup_logging(config).is_ok());
    assert!(!callbridge::VERSION.is_empty());
}
