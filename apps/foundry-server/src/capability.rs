use crate::auth::AuthContext;

/// Host-side permission check run after a request authenticated.
pub(crate) trait CapabilityGate: Send + Sync {
    fn allows(&self, ctx: &AuthContext, route: &str) -> bool;
}

/// Any authenticated caller passes unless an admin list is configured, in which
/// case `x-foundry-actor` must name one of its entries (wildcards allowed).
///
/// The actor header is not covered by the request signature: any holder of the
/// shared secret can claim any name. The list narrows which operator label a
/// well-behaved client uses; it does not separate secret holders from each other.
pub(crate) struct AdminActors {
    actors: Vec<String>,
}

impl AdminActors {
    pub fn new(actors: Vec<String>) -> Self {
        Self { actors }
    }
}

impl CapabilityGate for AdminActors {
    fn allows(&self, ctx: &AuthContext, _route: &str) -> bool {
        if self.actors.is_empty() {
            return true;
        }
        match ctx.actor.as_deref() {
            Some(actor) => self
                .actors
                .iter()
                .any(|pattern| crate::util::wildcard_matches(pattern, actor)),
            None => false,
        }
    }
}
