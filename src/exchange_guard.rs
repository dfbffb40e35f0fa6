//! Reserved-exchange validation, grounded on `ExchangeGuard` in `SPEC_FULL.md`
//! §4.2. Reserved names are pre-declared by the broker; declaring them is a
//! protocol error, so the guard's `assert` is a no-op for them.

use lapin::{options::ExchangeDeclareOptions, types::FieldTable, Channel, ExchangeKind};
use tracing::warn;

const RESERVED: &[&str] = &[
    "",
    "amq.direct",
    "amq.fanout",
    "amq.topic",
    "amq.headers",
    "amq.match",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// Emits a non-fatal advisory for reserved names; never returns an error.
pub fn validate(name: &str) {
    if is_reserved(name) {
        warn!(exchange = %name, "exchange name is reserved by the broker; skipping declaration");
    }
}

/// Declares `name` as a durable direct exchange, unless it is reserved.
/// Every binding this crate creates uses a literal routing key — the retry
/// cycle's internal hops (see `crate::consumer::topology`) route by queue
/// name or a single reserved literal key rather than a wildcard pattern, so
/// direct-exchange equality matching is sufficient everywhere.
pub async fn assert_exchange(channel: &Channel, name: &str) -> Result<(), lapin::Error> {
    validate(name);
    if is_reserved(name) {
        return Ok(());
    }

    channel
        .exchange_declare(
            name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_amq_prefixed_names_are_reserved() {
        assert!(is_reserved(""));
        assert!(is_reserved("amq.direct"));
        assert!(is_reserved("amq.fanout"));
        assert!(is_reserved("amq.topic"));
        assert!(is_reserved("amq.headers"));
        assert!(is_reserved("amq.match"));
    }

    #[test]
    fn custom_names_are_not_reserved() {
        assert!(!is_reserved("orders"));
        assert!(!is_reserved("amq.custom"));
    }
}
