use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::envelope::{Envelope, EnvelopeKind, ProtocolError};

type Handler<C, O> = Box<dyn Fn(&mut C, Envelope) -> Option<BoxFuture<'static, O>> + Send + Sync>;

/// Result of routing one envelope.
pub enum Dispatch<O> {
    /// The handler finished synchronously.
    Completed,
    /// The handler started long-running work; the caller decides whether to
    /// await it, spawn it, or drop it.
    Deferred(BoxFuture<'static, O>),
    /// No handler is registered for the kind.
    Unhandled(EnvelopeKind),
}

impl<O> std::fmt::Debug for Dispatch<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Completed => f.write_str("Completed"),
            Dispatch::Deferred(_) => f.write_str("Deferred"),
            Dispatch::Unhandled(kind) => write!(f, "Unhandled({kind})"),
        }
    }
}

/// One handler per envelope kind, invoked with mutable access to the owning
/// actor's context `C`.
pub struct Dispatcher<C, O = ()> {
    label: &'static str,
    handlers: HashMap<EnvelopeKind, Handler<C, O>>,
}

impl<C, O> Dispatcher<C, O> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `kind`, silently replacing any previous one.
    pub fn register<F>(&mut self, kind: EnvelopeKind, handler: F) -> &mut Self
    where
        F: Fn(&mut C, Envelope) -> Option<BoxFuture<'static, O>> + Send + Sync + 'static,
    {
        if self.handlers.insert(kind, Box::new(handler)).is_some() {
            tracing::debug!(dispatcher = self.label, kind = %kind, "handler replaced");
        }
        self
    }

    pub fn handles(&self, kind: EnvelopeKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn dispatch(&self, ctx: &mut C, envelope: Envelope) -> Dispatch<O> {
        let kind = envelope.kind;
        let Some(handler) = self.handlers.get(&kind) else {
            tracing::warn!(
                dispatcher = self.label,
                kind = %kind,
                id = ?envelope.id,
                "no handler registered, envelope dropped"
            );
            return Dispatch::Unhandled(kind);
        };
        match handler(ctx, envelope) {
            Some(future) => Dispatch::Deferred(future),
            None => Dispatch::Completed,
        }
    }

    /// Decode and dispatch a raw line. Invalid envelopes, including unknown
    /// kinds, are returned as errors and never reach a handler.
    pub fn dispatch_raw(&self, ctx: &mut C, line: &str) -> Result<Dispatch<O>, ProtocolError> {
        let envelope = Envelope::decode(line).map_err(|err| {
            tracing::warn!(dispatcher = self.label, error = %err, "rejected envelope");
            err
        })?;
        Ok(self.dispatch(ctx, envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    #[test]
    fn routes_by_kind() {
        let mut dispatcher = Dispatcher::<Recorder>::new("test");
        dispatcher.register(EnvelopeKind::WriteOutput, |ctx, envelope| {
            ctx.seen.push(envelope.text().unwrap_or_default().to_string());
            None
        });

        let mut recorder = Recorder::default();
        let outcome = dispatcher.dispatch(&mut recorder, Envelope::write_output("hi"));
        assert!(matches!(outcome, Dispatch::Completed));
        assert_eq!(recorder.seen, vec!["hi"]);
    }

    #[test]
    fn registering_twice_keeps_only_the_latest_handler() {
        let mut dispatcher = Dispatcher::<Recorder>::new("test");
        dispatcher
            .register(EnvelopeKind::WriteError, |ctx, _| {
                ctx.seen.push("first".to_string());
                None
            })
            .register(EnvelopeKind::WriteError, |ctx, _| {
                ctx.seen.push("second".to_string());
                None
            });

        let mut recorder = Recorder::default();
        dispatcher.dispatch(&mut recorder, Envelope::write_error("x"));
        assert_eq!(recorder.seen, vec!["second"]);
    }

    #[test]
    fn missing_handler_is_reported_not_raised() {
        let dispatcher = Dispatcher::<Recorder>::new("test");
        let mut recorder = Recorder::default();
        let outcome = dispatcher.dispatch(&mut recorder, Envelope::loaded(None));
        assert!(matches!(outcome, Dispatch::Unhandled(EnvelopeKind::Loaded)));
    }

    #[test]
    fn unknown_kinds_never_reach_handlers() {
        let mut dispatcher = Dispatcher::<Recorder>::new("test");
        dispatcher.register(EnvelopeKind::WriteOutput, |ctx, _| {
            ctx.seen.push("called".to_string());
            None
        });
        let mut recorder = Recorder::default();
        let result = dispatcher.dispatch_raw(&mut recorder, r#"{"kind":"write-outptu"}"#);
        assert!(matches!(result, Err(ProtocolError::UnknownKind(_))));
        assert!(recorder.seen.is_empty());
    }

    #[tokio::test]
    async fn deferred_work_runs_only_when_awaited() {
        let mut dispatcher = Dispatcher::<Recorder, u64>::new("test");
        dispatcher.register(EnvelopeKind::RunCode, |_, envelope| {
            let id = envelope.id.unwrap_or_default();
            Some(async move { id * 10 }.boxed())
        });

        let mut recorder = Recorder::default();
        match dispatcher.dispatch(&mut recorder, Envelope::run_code(4, "x")) {
            Dispatch::Deferred(future) => assert_eq!(future.await, 40),
            other => panic!("expected deferred work, got {other:?}"),
        }
    }
}
