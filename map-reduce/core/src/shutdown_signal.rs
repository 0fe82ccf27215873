// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use tokio_util::sync::CancellationToken;

/// Trait for shutdown signaling
pub trait ShutdownSignal: Clone + Send + Sync + 'static {
    fn is_cancelled(&self) -> bool;

    /// Resolves once shutdown is requested
    fn cancelled(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Tokio CancellationToken-based shutdown signal
#[derive(Clone, Default)]
pub struct TokenShutdownSignal {
    token: CancellationToken,
}

impl TokenShutdownSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl ShutdownSignal for TokenShutdownSignal {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
