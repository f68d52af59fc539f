//! Interceptor composition helpers.
//!
//! These helpers build new interceptors out of existing ones using nothing
//! but the public [`Interceptor`] / [`Next`] contract:
//!
//! ```rust,ignore
//! use switchyard_framework::compose::*;
//!
//! router.use_interceptor(compose([auth(), audit()]));
//! router.use_interceptor(for_pattern("admin.**", require_admin()));
//! router.use_interceptor(except(["health.check"], rate_limit()));
//! router.use_interceptor(branch(|env| env.header("x-beta").is_some(), beta(), stable()));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use switchyard_core::{
    BoxedInterceptor, Envelope, Interceptor, Next, Outcome, RpcResult, Terminal, async_trait,
};

type Predicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

// ============================================================================
// compose
// ============================================================================

/// Runs several interceptors as one, in the given order.
pub struct Composed {
    chain: Arc<[BoxedInterceptor]>,
}

/// Combines `interceptors` into a single interceptor. The first one is the
/// outermost.
pub fn compose(interceptors: impl IntoIterator<Item = BoxedInterceptor>) -> Composed {
    Composed {
        chain: interceptors.into_iter().collect(),
    }
}

#[async_trait]
impl Interceptor for Composed {
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome> {
        // The inner chain's terminal continues the outer chain. `Next` clones
        // share their run-once flag, so continuing twice is still caught.
        let terminal: Arc<dyn Terminal> = Arc::new(move |envelope: Envelope| next.clone().run(envelope));
        Next::new(Arc::clone(&self.chain), terminal).run(envelope).await
    }
}

impl fmt::Debug for Composed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composed").field("len", &self.chain.len()).finish()
    }
}

// ============================================================================
// Conditional
// ============================================================================

/// Runs one of two interceptors depending on the envelope.
///
/// Without an `otherwise` branch, non-matching envelopes continue down the
/// chain untouched.
pub struct Conditional {
    predicate: Predicate,
    then: BoxedInterceptor,
    otherwise: Option<BoxedInterceptor>,
}

#[async_trait]
impl Interceptor for Conditional {
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome> {
        if (self.predicate)(&envelope) {
            self.then.intercept(envelope, next).await
        } else if let Some(otherwise) = &self.otherwise {
            otherwise.intercept(envelope, next).await
        } else {
            next.run(envelope).await
        }
    }
}

impl fmt::Debug for Conditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conditional")
            .field("has_otherwise", &self.otherwise.is_some())
            .finish_non_exhaustive()
    }
}

/// Runs `interceptor` only for envelopes matching `predicate`.
pub fn when<P, I>(predicate: P, interceptor: I) -> Conditional
where
    P: Fn(&Envelope) -> bool + Send + Sync + 'static,
    I: Interceptor,
{
    Conditional {
        predicate: Arc::new(predicate),
        then: Arc::new(interceptor),
        otherwise: None,
    }
}

/// Runs `if_true` for envelopes matching `predicate`, `if_false` for the rest.
pub fn branch<P, T, F>(predicate: P, if_true: T, if_false: F) -> Conditional
where
    P: Fn(&Envelope) -> bool + Send + Sync + 'static,
    T: Interceptor,
    F: Interceptor,
{
    Conditional {
        predicate: Arc::new(predicate),
        then: Arc::new(if_true),
        otherwise: Some(Arc::new(if_false)),
    }
}

/// Runs `interceptor` only for the named procedures.
pub fn for_procedures<I, S>(names: impl IntoIterator<Item = S>, interceptor: I) -> Conditional
where
    I: Interceptor,
    S: Into<String>,
{
    let names: HashSet<String> = names.into_iter().map(Into::into).collect();
    when(move |envelope| names.contains(envelope.procedure()), interceptor)
}

/// Runs `interceptor` for every procedure except the named ones.
pub fn except<I, S>(names: impl IntoIterator<Item = S>, interceptor: I) -> Conditional
where
    I: Interceptor,
    S: Into<String>,
{
    let names: HashSet<String> = names.into_iter().map(Into::into).collect();
    when(move |envelope| !names.contains(envelope.procedure()), interceptor)
}

/// Runs `interceptor` for procedures matching a [`ProcedurePattern`].
pub fn for_pattern<I: Interceptor>(pattern: &str, interceptor: I) -> Conditional {
    let pattern = ProcedurePattern::new(pattern);
    when(move |envelope| pattern.matches(envelope.procedure()), interceptor)
}

// ============================================================================
// ProcedurePattern
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment.
    Any,
    /// `**`: zero or more segments.
    Rest,
}

/// A dot-separated procedure name pattern.
///
/// `*` matches exactly one segment and `**` matches any number of segments,
/// including none: `user.*` matches `user.get` but not `user.admin.get`,
/// `admin.**` matches `admin`, `admin.ban` and `admin.users.ban`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedurePattern {
    segments: Vec<Segment>,
}

impl ProcedurePattern {
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|segment| match segment {
                "*" => Segment::Any,
                "**" => Segment::Rest,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        Self { segments }
    }

    pub fn matches(&self, procedure: &str) -> bool {
        let parts: Vec<&str> = procedure.split('.').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::Rest, rest)) => (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..])),
        Some((segment, rest)) => match parts.split_first() {
            Some((part, remaining)) => {
                let head = match segment {
                    Segment::Literal(literal) => literal == part,
                    _ => true,
                };
                head && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}
