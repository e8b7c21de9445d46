use crate::AppState;
use broker::{BrokerClient, MemoryBroker};
use clap::Parser;
use domain::{Id, Principal, PrincipalDirectory, Role};
use service::config::Config;
use std::sync::Arc;

pub(crate) const ALICE_TOKEN: &str = "alice-token";
pub(crate) const ADMIN_TOKEN: &str = "admin-token";
pub(crate) const INACTIVE_TOKEN: &str = "inactive-token";

pub(crate) struct Fixture {
    pub state: AppState,
    pub broker: Arc<MemoryBroker>,
    pub alice: Principal,
}

/// App state over an in-memory broker with three principals: `alice` may read and
/// update orders, `admin` is a superuser and `bob` is inactive.
pub(crate) fn fixture() -> Fixture {
    let config = Config::try_parse_from([
        "streaming_platform_rs",
        "--streaming-broker",
        "memory",
        "--send-queue-capacity",
        "16",
    ])
    .unwrap();

    let alice = Principal::new(Id::new_v4(), "alice")
        .with_role(Role::new("clerk", &["read_order", "update_order"]));
    let directory = PrincipalDirectory::new();
    directory.insert(ALICE_TOKEN, alice.clone());
    directory.insert(ADMIN_TOKEN, Principal::new(Id::new_v4(), "admin").superuser());
    directory.insert(INACTIVE_TOKEN, Principal::new(Id::new_v4(), "bob").inactive());

    let broker = Arc::new(MemoryBroker::broadcast());
    let client: Arc<dyn BrokerClient> = broker.clone();
    Fixture {
        state: AppState::new(config, client, Arc::new(directory)),
        broker,
        alice,
    }
}
