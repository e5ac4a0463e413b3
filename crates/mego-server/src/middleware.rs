//! Built-in middleware.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mego_core::human_bytes;
use mego_protocol::Status;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::method::{Handler, handler};

/// Logs every dispatch with its outcome and duration.
pub fn logger() -> Handler {
    handler(|ctx| {
        let started = Instant::now();
        ctx.next();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let uploaded: u64 = ctx.all_files().values().flatten().map(|f| f.size).sum();

        if let Some(err) = ctx.errors().last() {
            warn!(
                method = %ctx.method(),
                session = %ctx.session().id(),
                id = ctx.id(),
                status = %err.status(),
                error = %err,
                elapsed_ms,
                "Request failed"
            );
        } else {
            info!(
                method = %ctx.method(),
                session = %ctx.session().id(),
                id = ctx.id(),
                state = ?ctx.state(),
                uploaded = %human_bytes(uploaded),
                elapsed_ms,
                "Request handled"
            );
        }
        Ok(())
    })
}

/// Catches panics in the rest of the chain and replies with `Status::Error`
/// if nothing was sent yet.
pub fn recovery() -> Handler {
    handler(|ctx| {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| ctx.next())) {
            error!(
                method = %ctx.method(),
                session = %ctx.session().id(),
                id = ctx.id(),
                panic = %panic_message(payload.as_ref()),
                "Handler panicked"
            );
            ctx.abort();
            if !ctx.has_responded() {
                ctx.respond_with_error(Status::Error, &(), "panic recovered")?;
            }
        }
        Ok(())
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Settings for [`rate_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Window length.
    pub period: Duration,
    /// Requests allowed per session and window.
    pub limit: usize,
}

struct Window {
    started: Instant,
    count: usize,
}

/// Caps requests per session in fixed windows, answering `TooManyRequests`.
pub fn rate_limit(config: RateLimitConfig) -> Handler {
    let windows: Arc<Mutex<HashMap<String, Window>>> = Arc::default();

    handler(move |ctx| {
        let allowed = {
            let now = Instant::now();
            let mut windows = windows.lock();
            if windows.len() > 4096 {
                windows.retain(|_, w| now.duration_since(w.started) < config.period);
            }

            let window = windows
                .entry(ctx.session().id().to_string())
                .or_insert(Window {
                    started: now,
                    count: 0,
                });
            if now.duration_since(window.started) >= config.period {
                window.started = now;
                window.count = 0;
            }
            window.count += 1;
            window.count <= config.limit
        };

        if allowed {
            ctx.next();
        } else {
            ctx.abort_with_status(Status::TooManyRequests);
        }
        Ok(())
    })
}

/// Settings for [`request_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimitConfig {
    /// Requests allowed in flight at once, across all sessions.
    pub limit: usize,
}

/// Caps requests in flight, answering `Busy`.
pub fn request_limit(config: RequestLimitConfig) -> Handler {
    let in_flight = Arc::new(AtomicUsize::new(0));

    handler(move |ctx| {
        if in_flight.fetch_add(1, Ordering::AcqRel) >= config.limit {
            in_flight.fetch_sub(1, Ordering::AcqRel);
            ctx.abort_with_status(Status::Busy);
            return Ok(());
        }

        let _guard = InFlight(&in_flight);
        ctx.next();
        Ok(())
    })
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::HandlerError;
    use crate::hub::Hub;
    use crate::session::Outbox;
    use bytes::Bytes;
    use mego_protocol::{Response, decode_message};
    use std::sync::Barrier;

    fn run(
        hub: &Hub,
        session: &Arc<crate::Session>,
        chain: Vec<Handler>,
    ) -> Context {
        let mut ctx = Context::new(session.clone(), hub.clone(), "Test", 1, Bytes::new(), chain);
        ctx.next();
        ctx
    }

    fn connect(hub: &Hub) -> (Arc<crate::Session>, Outbox) {
        hub.create_session(16).unwrap()
    }

    fn last_status(rx: &mut Outbox) -> Option<Status> {
        let mut last = None;
        while let Ok(frame) = rx.try_recv() {
            let response: Response = decode_message(&frame).unwrap();
            last = response.error.and_then(|e| e.status());
        }
        last
    }

    #[test]
    fn recovery_turns_panic_into_error_reply() {
        let hub = Hub::new(4);
        let (session, mut rx) = connect(&hub);
        let chain = vec![recovery(), handler(|_| panic!("boom"))];

        let ctx = run(&hub, &session, chain);
        assert!(ctx.is_aborted());
        assert_eq!(last_status(&mut rx), Some(Status::Error));
    }

    #[test]
    fn recovery_keeps_an_earlier_reply() {
        let hub = Hub::new(4);
        let (session, mut rx) = connect(&hub);
        let chain = vec![
            recovery(),
            handler(|ctx| {
                ctx.respond(&"done")?;
                panic!("late boom")
            }),
        ];

        let ctx = run(&hub, &session, chain);
        assert!(ctx.is_aborted());
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(decode_message::<Response>(&frame).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert!(frames[0].error.is_none());
    }

    #[test]
    fn logger_passes_through() {
        let hub = Hub::new(4);
        let (session, mut rx) = connect(&hub);
        let chain = vec![
            logger(),
            handler(|_| Err(HandlerError::new(Status::Exists, "taken"))),
        ];

        let ctx = run(&hub, &session, chain);
        assert_eq!(ctx.errors().len(), 1);
        assert_eq!(last_status(&mut rx), Some(Status::Exists));
    }

    #[test]
    fn rate_limit_per_session() {
        let hub = Hub::new(4);
        let (a, mut rx_a) = connect(&hub);
        let (b, mut rx_b) = connect(&hub);
        let limiter = rate_limit(RateLimitConfig {
            period: Duration::from_secs(60),
            limit: 2,
        });
        let chain = || vec![limiter.clone(), handler(|ctx| ctx.respond(&"ok"))];

        for _ in 0..2 {
            run(&hub, &a, chain());
        }
        assert_eq!(last_status(&mut rx_a), None);

        let ctx = run(&hub, &a, chain());
        assert!(ctx.is_aborted());
        assert_eq!(last_status(&mut rx_a), Some(Status::TooManyRequests));

        run(&hub, &b, chain());
        assert_eq!(last_status(&mut rx_b), None);
    }

    #[test]
    fn rate_limit_window_resets() {
        let hub = Hub::new(4);
        let (a, mut rx) = connect(&hub);
        let limiter = rate_limit(RateLimitConfig {
            period: Duration::from_millis(20),
            limit: 1,
        });
        let chain = || vec![limiter.clone(), handler(|ctx| ctx.respond(&"ok"))];

        run(&hub, &a, chain());
        assert!(run(&hub, &a, chain()).is_aborted());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!run(&hub, &a, chain()).is_aborted());
        let _ = last_status(&mut rx);
    }

    #[test]
    fn request_limit_rejects_when_full() {
        let hub = Hub::new(4);
        let (a, _rx_a) = connect(&hub);
        let (b, mut rx_b) = connect(&hub);
        let limiter = request_limit(RequestLimitConfig { limit: 1 });

        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let slow = {
            let entered = entered.clone();
            let release = release.clone();
            handler(move |_| {
                entered.wait();
                release.wait();
                Ok(())
            })
        };

        let busy_chain = vec![limiter.clone(), slow];
        let worker = {
            let hub = hub.clone();
            let a = a.clone();
            std::thread::spawn(move || {
                run(&hub, &a, busy_chain);
            })
        };

        entered.wait();
        let ctx = run(&hub, &b, vec![limiter.clone(), handler(|_| Ok(()))]);
        assert!(ctx.is_aborted());
        assert_eq!(last_status(&mut rx_b), Some(Status::Busy));
        release.wait();
        worker.join().unwrap();

        let ctx = run(&hub, &b, vec![limiter, handler(|_| Ok(()))]);
        assert!(!ctx.is_aborted());
    }
}
