#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spanner_pool::{
    DatabaseId, Error, RpcClientFactory, SessionPoolConfig, SessionPoolConfigBuilder,
    SessionService,
};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

/// Scriptable in-memory stand-in for the Cloud Spanner session API.
///
/// Tracks which sessions are live on the "server" and lets tests inject
/// failures per RPC kind.
pub struct MockSessionService {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    live: HashSet<String>,
    deleted: Vec<String>,
    creates: u64,
    pings: u64,
    begins: u64,
    create_delay: Option<Duration>,
    create_error: Option<(Code, String)>,
    ping_error: Option<(Code, String)>,
    begin_error: Option<(Code, String)>,
}

impl MockSessionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn fail_creates(&self, code: Code, message: &str) {
        self.state.lock().unwrap().create_error = Some((code, message.to_string()));
    }

    /// Makes every subsequent create RPC take `delay` to complete.
    pub fn delay_creates(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    pub fn fail_pings(&self, code: Code, message: &str) {
        self.state.lock().unwrap().ping_error = Some((code, message.to_string()));
    }

    pub fn fail_begins(&self, code: Code, message: &str) {
        self.state.lock().unwrap().begin_error = Some((code, message.to_string()));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.create_error = None;
        state.ping_error = None;
        state.begin_error = None;
    }

    /// Total create RPCs that succeeded.
    pub fn created(&self) -> u64 {
        self.state.lock().unwrap().creates
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// Sessions the server still knows about.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn pings(&self) -> u64 {
        self.state.lock().unwrap().pings
    }

    pub fn begins(&self) -> u64 {
        self.state.lock().unwrap().begins
    }

    fn scripted(slot: &Option<(Code, String)>) -> Option<Error> {
        slot.as_ref()
            .map(|(code, message)| Error::from(Status::new(*code, message.clone())))
    }
}

#[async_trait]
impl SessionService for MockSessionService {
    async fn create_session(
        &self,
        database: &str,
        _labels: &HashMap<String, String>,
        _md: &MetadataMap,
    ) -> Result<String, Error> {
        let delay = {
            let state = self.state.lock().unwrap();
            if let Some(err) = Self::scripted(&state.create_error) {
                return Err(err);
            }
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        state.creates += 1;
        let name = format!("{database}/sessions/s{}", state.next_id);
        state.live.insert(name.clone());
        Ok(name)
    }

    async fn get_session(&self, name: &str, _md: &MetadataMap) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.pings += 1;
        if let Some(err) = Self::scripted(&state.ping_error) {
            return Err(err);
        }
        if state.live.contains(name) {
            Ok(())
        } else {
            Err(Error::from(Status::new(
                Code::NotFound,
                format!("Session not found: {name}"),
            )))
        }
    }

    async fn delete_session(&self, name: &str, _md: &MetadataMap) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.live.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn begin_transaction(&self, session: &str, _md: &MetadataMap) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::scripted(&state.begin_error) {
            return Err(err);
        }
        state.begins += 1;
        Ok(format!("tx-{}", state.begins).into_bytes())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn database() -> DatabaseId {
    DatabaseId::new("test-project", "test-instance", "test-database")
}

pub fn config_with(service: &Arc<MockSessionService>) -> SessionPoolConfigBuilder {
    SessionPoolConfig::builder()
        .rpc_client(RpcClientFactory::from_service(
            service.clone() as Arc<dyn SessionService>
        ))
}
