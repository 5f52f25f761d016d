//! Applying a new listener configuration at runtime.

use std::net::SocketAddr;

use tracing::{info, warn};

use crate::config::SmtpConfig;
use crate::error::Result;
use crate::smtp::server::SmtpListener;

/// Restart `listener` under `config`.
///
/// A bind failure is returned to the caller so it can ask for different
/// settings; the listener is then stopped but keeps `config`, so a later
/// [`SmtpListener::bind`] retries the same address.
pub fn apply(listener: &mut SmtpListener, config: SmtpConfig) -> Result<SocketAddr> {
    if listener.is_bound() && listener.config() == &config {
        if let Some(addr) = listener.local_addr() {
            return Ok(addr);
        }
    }

    let target = config.address();
    listener.reconfigure(config);
    match listener.bind() {
        Ok(addr) => {
            info!(addr = %addr, "SMTP listener rebound");
            Ok(addr)
        }
        Err(e) => {
            warn!(addr = %target, error = %e, "Rebind failed; listener stopped");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{mpsc, Arc};

    use crate::error::PapercutError;
    use crate::store::MessageStore;

    fn listener(dir: &std::path::Path) -> SmtpListener {
        let store = Arc::new(MessageStore::open(dir, "eml").unwrap());
        let (tx, _rx) = mpsc::channel();
        let config = SmtpConfig {
            port: 0,
            ..SmtpConfig::default()
        };
        SmtpListener::new(config, store, tx)
    }

    #[test]
    fn test_failed_rebind_leaves_listener_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut smtp = listener(dir.path());
        smtp.start("127.0.0.1", 0).unwrap();

        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = SmtpConfig {
            host: "127.0.0.1".into(),
            port: taken.local_addr().unwrap().port(),
            ..SmtpConfig::default()
        };
        let err = apply(&mut smtp, busy.clone()).unwrap_err();
        assert!(matches!(err, PapercutError::Bind { .. }));
        assert!(!smtp.is_bound());
        assert_eq!(smtp.config(), &busy);

        drop(taken);
        let free = SmtpConfig {
            port: 0,
            ..busy
        };
        apply(&mut smtp, free).unwrap();
        assert!(smtp.is_bound());
    }

    #[test]
    fn test_unchanged_config_keeps_running_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut smtp = listener(dir.path());
        let addr = smtp.start("127.0.0.1", 0).unwrap();
        let same = smtp.config().clone();
        assert_eq!(apply(&mut smtp, same).unwrap(), addr);
    }
}
