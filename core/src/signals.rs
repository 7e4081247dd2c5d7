use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

pub trait Shutdown: Send + Sync + 'static {
    fn shutdown(self: &Arc<Self>);
}

/// Binds ctrl+c to a shutdown target. The first signal requests a graceful
/// shutdown, the third one halts the process.
pub struct Signals<T: Shutdown> {
    target: Weak<T>,
    iterations: AtomicU64,
}

impl<T: Shutdown> Signals<T> {
    pub fn new(target: &Arc<T>) -> Signals<T> {
        Signals { target: Arc::downgrade(target), iterations: AtomicU64::new(0) }
    }

    pub fn init(self: &Arc<Signals<T>>) -> Result<(), ctrlc::Error> {
        let signals = self.clone();
        ctrlc::set_handler(move || {
            let v = signals.iterations.fetch_add(1, Ordering::SeqCst);
            if v > 1 {
                println!("^SIGNAL - halting");
                std::process::exit(1);
            }

            println!("^SIGNAL - shutting down (press ctrl+c two more times to halt)");
            if let Some(target) = signals.target.upgrade() {
                target.shutdown();
            }
        })
    }
}
