use crate::{
    signals::Shutdown,
    task::service::{AsyncService, AsyncServiceError, AsyncServiceResult},
    trace, warn,
};
use futures_util::future::{join_all, try_join_all};
use std::sync::{Arc, Mutex};

/// AsyncRuntime registers async services and provides
/// a tokio Runtime to run them.
pub struct AsyncRuntime {
    threads: usize,
    services: Mutex<Vec<Arc<dyn AsyncService>>>,
}

impl AsyncRuntime {
    pub fn new(threads: usize) -> Self {
        trace!("Creating the async-runtime service");
        Self { threads: threads.max(1), services: Mutex::new(Vec::new()) }
    }

    pub fn register<T>(&self, service: Arc<T>)
    where
        T: AsyncService,
    {
        if let Ok(mut services) = self.services.lock() {
            services.push(service);
        }
    }

    fn services(&self) -> Vec<Arc<dyn AsyncService>> {
        self.services.lock().map(|services| services.clone()).unwrap_or_default()
    }

    /// Builds a multi-threaded tokio runtime and blocks the current thread until all services exit
    pub fn run(self: &Arc<AsyncRuntime>) -> AsyncServiceResult<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.threads)
            .thread_name("async-runtime")
            .enable_all()
            .build()
            .map_err(|err| AsyncServiceError::Service(format!("failed building tokio runtime: {err}")))?;
        runtime.block_on(self.worker())
    }

    pub async fn worker(self: &Arc<AsyncRuntime>) -> AsyncServiceResult<()> {
        let services = self.services();
        trace!("async-runtime worker starting {} services", services.len());

        // Start all async services
        let futures = services.iter().map(|service| tokio::spawn(service.clone().start())).collect::<Vec<_>>();
        let result = match try_join_all(futures).await {
            Ok(results) => results.into_iter().collect::<AsyncServiceResult<Vec<()>>>().map(|_| ()),
            Err(err) => Err(AsyncServiceError::Service(format!("service task failed: {err}"))),
        };
        if let Err(err) = &result {
            warn!("async-runtime: {err}");
            // Make sure all other services are released before stopping
            self.signal_exit();
        }

        // Stop all async services
        trace!("async-runtime worker stopping services");
        let stops = join_all(services.iter().map(|service| service.clone().stop())).await;
        for (service, stop) in services.iter().zip(stops) {
            if let Err(err) = stop {
                warn!("{} stop error: {err}", service.clone().ident());
            }
        }

        trace!("async-runtime worker exiting");
        result
    }

    pub fn signal_exit(self: &Arc<AsyncRuntime>) {
        trace!("Sending an exit signal to all async-runtime services");
        for service in self.services() {
            service.signal_exit();
        }
    }
}

impl Shutdown for AsyncRuntime {
    fn shutdown(self: &Arc<Self>) {
        self.signal_exit();
    }
}
