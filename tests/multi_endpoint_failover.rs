//! Failover between independent endpoints, driven through the public API.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use routis::failover::{
    CircuitBreakerExecutor, CircuitState, EndpointConfig, MultiEndpointConfig,
    MultiEndpointProvider, RetryConfig,
};
use routis::mocks::MockConnector;
use routis::{Client, Error, HostAndPort};

fn primary() -> HostAndPort {
    HostAndPort::new("primary.example", 6379)
}

fn standby() -> HostAndPort {
    HostAndPort::new("standby.example", 6379)
}

fn setup(connector: &MockConnector) -> (Client, Arc<MultiEndpointProvider>) {
    let config = MultiEndpointConfig::new(vec![
        EndpointConfig::new(standby(), 2),
        EndpointConfig::new(primary(), 1),
    ])
    .with_retry(RetryConfig::default().with_backoff(Duration::from_millis(100), 2.0));
    let provider = Arc::new(
        MultiEndpointProvider::with_connector(config, Arc::new(connector.clone())).unwrap(),
    );
    let executor = CircuitBreakerExecutor::new(Arc::clone(&provider));
    (Client::with_executor(Arc::new(executor)), provider)
}

#[tokio::test(start_paused = true)]
async fn test_outage_failover_and_failback() {
    let connector = MockConnector::new();
    let (client, provider) = setup(&connector);
    let notified = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notified);
    provider.set_failover_hook(move |name| sink.lock().push(name.to_string()));

    client.set("k", "v").await.unwrap();
    assert_eq!(connector.commands(&primary()), ["SET k v"]);

    // Primary goes away: the retried call fails and fills the window.
    connector.set_down(&primary(), true);
    assert!(client.ping().await.unwrap_err().is_connection_error());
    assert_eq!(
        provider.endpoint(1).unwrap().breaker().state(),
        CircuitState::Open
    );

    // The next call fails over and succeeds on the standby.
    client.ping().await.unwrap();
    assert_eq!(provider.active_index(), 2);
    assert_eq!(connector.commands(&standby()), ["PING"]);
    assert_eq!(*notified.lock(), ["endpoint:2:standby.example:6379"]);

    // Failing back to an endpoint that is still down is refused.
    assert!(matches!(
        provider.fail_back_to(1).await,
        Err(Error::Validation { .. })
    ));
    assert_eq!(
        provider.endpoint(1).unwrap().breaker().state(),
        CircuitState::ForcedOpen
    );

    connector.set_down(&primary(), false);
    provider.fail_back_to(1).await.unwrap();
    connector.clear_log();
    client.get("k").await.unwrap();
    assert_eq!(connector.commands(&primary()), ["GET k"]);
    assert!(connector.commands(&standby()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_is_terminal_until_failback() {
    let connector = MockConnector::new();
    let (client, provider) = setup(&connector);
    connector.set_down(&primary(), true);
    connector.set_down(&standby(), true);

    // Each breaker opens after two failed calls.
    for _ in 0..2 {
        assert!(client.ping().await.unwrap_err().is_connection_error());
    }
    assert!(client.ping().await.unwrap_err().is_connection_error());
    assert_eq!(provider.active_index(), 2);
    assert!(client.ping().await.unwrap_err().is_connection_error());

    match client.ping().await.unwrap_err() {
        Error::NoFurtherEndpoint { endpoint, source } => {
            assert_eq!(endpoint, "endpoint:2:standby.example:6379");
            assert!(source.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(provider.is_last_endpoint_exhausted());
    assert!(matches!(
        client.ping().await,
        Err(Error::NoFurtherEndpoint { .. })
    ));

    connector.set_down(&primary(), false);
    provider.fail_back_to(1).await.unwrap();
    assert!(!provider.is_last_endpoint_exhausted());
    client.ping().await.unwrap();
}
