// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::coordinator::{Coordinator, ReportAck, TaskResponse};
use crate::task::{TaskReport, WorkerId};
use async_trait::async_trait;
use std::sync::Arc;

/// The only path between workers and the coordinator
/// Different implementations for in-process calls, sockets, RPC, etc.
#[async_trait]
pub trait TaskChannel: Clone + Send + Sync + 'static {
    async fn request_task(&self, worker_id: WorkerId) -> TaskResponse;

    async fn report_task_result(&self, report: TaskReport) -> ReportAck;
}

/// In-process channel calling the coordinator directly
#[derive(Clone)]
pub struct LocalTaskChannel {
    coordinator: Arc<Coordinator>,
}

impl LocalTaskChannel {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl TaskChannel for LocalTaskChannel {
    async fn request_task(&self, worker_id: WorkerId) -> TaskResponse {
        self.coordinator.request_task(worker_id)
    }

    async fn report_task_result(&self, report: TaskReport) -> ReportAck {
        self.coordinator.report_task_result(report)
    }
}
