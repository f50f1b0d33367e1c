// eventshop-rpc-core/src/events.rs
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::MessagingError;

pub type ErrorHandler = Arc<dyn Fn(&MessagingError) + Send + Sync>;

/// Fan-out hook for faults that have no caller to return to.
#[derive(Clone, Default)]
pub struct ErrorListeners {
    handlers: Arc<RwLock<Vec<ErrorHandler>>>,
}

impl ErrorListeners {
    pub fn add(&self, handler: ErrorHandler) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    pub fn emit(&self, err: &MessagingError) {
        error!("{err}");
        // copia para no llamar handlers con el lock tomado
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(err);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn every_listener_sees_the_error() {
        let listeners = ErrorListeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            listeners.add(Arc::new(move |e: &MessagingError| {
                seen.lock().unwrap().push(e.to_string())
            }));
        }

        listeners.emit(&MessagingError::internal("boom"));
        assert_eq!(*seen.lock().unwrap(), vec!["boom", "boom"]);
    }
}
