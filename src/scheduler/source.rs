use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{PipelineError, Result};
use crate::types::WorkItem;

/// Where the scheduler gets the full work item for an id
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<WorkItem>;
}

/// Every work item held in memory. Suited to small datasets and tests.
#[derive(Debug, Default)]
pub struct InMemorySource {
    items: HashMap<String, WorkItem>,
}

impl InMemorySource {
    pub fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.id.clone(), item)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl WorkItemSource for InMemorySource {
    async fn fetch(&self, id: &str) -> Result<WorkItem> {
        self.items
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::ItemNotFound(id.to_string()))
    }
}
