//! Dialplan applications runnable against a leg (`group_confirm_key=exec`)

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::channel::ChannelHandle;

#[async_trait]
pub trait Application: Send + Sync {
    async fn execute(&self, channel: &ChannelHandle, args: Option<&str>) -> anyhow::Result<()>;
}

pub trait ApplicationRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn Application>>;
}

/// Concurrent name to application table.
#[derive(Default)]
pub struct ApplicationTable {
    apps: DashMap<String, Arc<dyn Application>>,
}

impl ApplicationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, app: Arc<dyn Application>) {
        self.apps.insert(name.into(), app);
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }
}

impl ApplicationRegistry for ApplicationTable {
    fn get(&self, name: &str) -> Option<Arc<dyn Application>> {
        self.apps.get(name).map(|entry| Arc::clone(entry.value()))
    }
}
