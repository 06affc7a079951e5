//! Collateral selection.
//!
//! Picks the pledgeable currency with the highest value
//! (`collateral_available × rate`). The bulk listing is tried first; when
//! it fails, has an unknown shape or holds nothing usable, a short list of
//! codes is probed one by one.

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::operations::Operations;
use crate::platforms::CurrencyListing;
use crate::types::Currency;

/// Highest-value currency with positive available collateral. Ties go to
/// the first in list order.
pub fn best_collateral(currencies: &[Currency]) -> Option<&Currency> {
    currencies
        .iter()
        .filter(|c| c.collateral_available > Decimal::ZERO)
        .fold(None, |best: Option<&Currency>, c| match best {
            Some(b) if c.collateral_value() <= b.collateral_value() => Some(b),
            _ => Some(c),
        })
}

pub async fn select_collateral(ops: &Operations, probe_codes: &[String]) -> Option<Currency> {
    match ops.list_currencies().await {
        Ok(CurrencyListing::Listed(currencies)) => {
            if let Some(best) = best_collateral(&currencies) {
                info!(collateral = %best, "Collateral selected from listing");
                return Some(best.clone());
            }
            debug!(listed = currencies.len(), "No usable collateral in listing");
        }
        Ok(CurrencyListing::Unrecognized) => {
            warn!("Currency listing has an unrecognized shape");
        }
        Err(e) => {
            warn!(error = %e, "Currency listing failed");
        }
    }

    info!(codes = ?probe_codes, "Probing collateral currencies individually");
    let mut probed = Vec::with_capacity(probe_codes.len());
    for code in probe_codes {
        match ops.currency(code).await {
            Ok(currency) => probed.push(currency),
            Err(e) => debug!(code = %code, error = %e, "Collateral probe failed"),
        }
    }

    let best = best_collateral(&probed).cloned();
    match &best {
        Some(c) => info!(collateral = %c, "Collateral selected by probing"),
        None => warn!("No collateral available for borrowing"),
    }
    best
}
