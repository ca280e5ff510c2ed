//! Span helpers for engine operations.
//!
//! Every helper returns `Span::none()` when tracing is disabled, so the
//! disabled path allocates nothing. Outcome fields are declared empty and
//! filled in with [`record_decision`] once known.

use crate::models::{AuthorizationDecision, CheckRequest, Entity, ZoneId};
use std::time::Instant;
use tracing::{field, info_span, Span};

pub fn check_span(enabled: bool, request: &CheckRequest) -> Span {
    if !enabled {
        return Span::none();
    }
    info_span!(
        "rebac.check",
        subject = %request.subject,
        permission = %request.permission,
        object = %request.object,
        zone = %request.zone,
        source = field::Empty,
        decision = field::Empty,
        layer = field::Empty,
        limit = field::Empty,
        latency_ms = field::Empty,
    )
}

pub fn check_batch_span(enabled: bool, size: usize) -> Span {
    if !enabled {
        return Span::none();
    }
    info_span!("rebac.check_batch", size, allowed = field::Empty, latency_ms = field::Empty)
}

pub fn expand_span(enabled: bool, permission: &str, object: &Entity, zone: &ZoneId) -> Span {
    if !enabled {
        return Span::none();
    }
    info_span!(
        "rebac.expand",
        permission = %permission,
        object = %object,
        zone = %zone,
        subjects = field::Empty,
        latency_ms = field::Empty,
    )
}

pub fn write_span(enabled: bool, subject: &Entity, relation: &str, object: &Entity, zone: &ZoneId) -> Span {
    if !enabled {
        return Span::none();
    }
    info_span!(
        "rebac.write",
        subject = %subject,
        relation = %relation,
        object = %object,
        zone = %zone,
        revision = field::Empty,
        latency_ms = field::Empty,
    )
}

pub fn write_batch_span(enabled: bool, size: usize) -> Span {
    if !enabled {
        return Span::none();
    }
    info_span!("rebac.write_batch", size, revision = field::Empty, latency_ms = field::Empty)
}

pub fn delete_span(enabled: bool, tuple_id: &str) -> Span {
    if !enabled {
        return Span::none();
    }
    info_span!(
        "rebac.delete",
        tuple_id = %tuple_id,
        zone = field::Empty,
        deleted = field::Empty,
        revision = field::Empty,
        latency_ms = field::Empty,
    )
}

pub fn list_span(enabled: bool, what: &'static str, zone: Option<&ZoneId>) -> Span {
    if !enabled {
        return Span::none();
    }
    let zone = zone.map(ZoneId::as_str).unwrap_or("*");
    info_span!("rebac.list", what, zone = %zone, items = field::Empty, latency_ms = field::Empty)
}

pub fn record_latency(span: &Span, started: Instant) {
    span.record("latency_ms", started.elapsed().as_secs_f64() * 1_000.0);
}

pub fn record_decision(span: &Span, decision: &AuthorizationDecision, started: Instant) {
    span.record("source", decision.source.as_str());
    span.record("decision", decision.allowed);
    span.record("layer", decision.layer.as_str());
    if let Some(limit) = decision.limit {
        span.record("limit", limit.as_str());
    }
    record_latency(span, started);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionLayer;

    #[test]
    fn test_disabled_spans_are_none() {
        let request = CheckRequest::new(Entity::user("a"), "read", Entity::file("/f"), ZoneId::default());
        let span = check_span(false, &request);
        assert!(span.is_none());
        // Recording into a disabled span is a no-op.
        record_decision(&span, &AuthorizationDecision::new(true, DecisionLayer::Rebac), Instant::now());
        assert!(write_batch_span(false, 3).is_none());
    }
}
