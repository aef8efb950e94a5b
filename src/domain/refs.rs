//! Reference registry
//!
//! Generates and validates the chain of correlation identifiers that tie one
//! ride's lifecycle together across asynchronous vendor calls: bid reference,
//! availability reference, authorization reference and the agent-side booking
//! reference. Pure generation and validation, no state.

use chrono::Utc;
use rand::Rng;

use crate::error::{ApiError, ApiResult};

/// The correlation references accumulated over one booking flow. Which slots
/// are populated depends on how far the flow has progressed.
#[derive(Debug, Clone, Default)]
pub struct ReferenceChain<'a> {
    pub bid: Option<&'a str>,
    pub availability: Option<&'a str>,
    pub authorization: Option<&'a str>,
    pub booking: Option<&'a str>,
}

/// Operations that require specific references to be present before they can
/// be sent to the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedOperation {
    AvailabilityCheck,
    Authorization,
    WebhookMatch,
}

/// Generate an agent-side booking reference, unique at practical request
/// volume: timestamp plus a random hex suffix.
pub fn new_booking_reference() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..0x1000000);
    format!("RB-{stamp}-{suffix:06X}")
}

/// Generate a bid reference for a new quote request.
pub fn new_bid_reference() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..0x1000000);
    format!("BID-{stamp}-{suffix:06X}")
}

/// Generate a settlement run identifier.
pub fn new_settlement_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..0x1000000);
    format!("STL-{stamp}-{suffix:06X}")
}

/// Fail when an operation's required references are absent or blank.
pub fn validate_chain(op: ChainedOperation, chain: &ReferenceChain<'_>) -> ApiResult<()> {
    let require = |slot: Option<&str>, name: &str| -> ApiResult<()> {
        match slot {
            Some(value) if !value.trim().is_empty() => Ok(()),
            _ => Err(ApiError::validation(format!("missing {name} reference"))),
        }
    };

    match op {
        ChainedOperation::AvailabilityCheck => require(chain.bid, "bid"),
        ChainedOperation::Authorization => {
            require(chain.availability, "availability")?;
            require(chain.booking, "booking")
        }
        ChainedOperation::WebhookMatch => require(chain.authorization, "authorization"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn booking_references_are_unique_and_well_formed() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let reference = new_booking_reference();
            assert!(reference.starts_with("RB-"), "got {reference}");
            assert!(seen.insert(reference));
        }
    }

    #[test]
    fn availability_check_requires_bid_reference() {
        let chain = ReferenceChain::default();
        let err = validate_chain(ChainedOperation::AvailabilityCheck, &chain).unwrap_err();
        assert!(err.to_string().contains("bid"));

        let chain = ReferenceChain {
            bid: Some("BID-1"),
            ..Default::default()
        };
        assert!(validate_chain(ChainedOperation::AvailabilityCheck, &chain).is_ok());
    }

    #[test]
    fn authorization_requires_availability_and_booking_references() {
        let chain = ReferenceChain {
            bid: Some("BID-1"),
            booking: Some("RB-1"),
            ..Default::default()
        };
        let err = validate_chain(ChainedOperation::Authorization, &chain).unwrap_err();
        assert!(err.to_string().contains("availability"));

        let chain = ReferenceChain {
            availability: Some("AV-1"),
            booking: Some("RB-1"),
            ..Default::default()
        };
        assert!(validate_chain(ChainedOperation::Authorization, &chain).is_ok());
    }

    #[test]
    fn blank_references_do_not_pass() {
        let chain = ReferenceChain {
            authorization: Some("   "),
            ..Default::default()
        };
        assert!(validate_chain(ChainedOperation::WebhookMatch, &chain).is_err());
    }
}
