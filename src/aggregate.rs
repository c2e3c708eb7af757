use crate::models::{Order, ResolutionSource, ResolvedProduct};
use crate::normalizer::{has_known_model, normalize};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLine {
    pub name: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct Aggregation {
    pub total: u64,
    pub lines: Vec<ReportLine>,
}

impl Aggregation {
    /// `"<total> units"` followed by one `"<name> — <qty>"` line per group.
    pub fn render(&self) -> Vec<String> {
        std::iter::once(format!("{} units", self.total))
            .chain(
                self.lines
                    .iter()
                    .map(|line| format!("{} — {}", line.name, line.quantity)),
            )
            .collect()
    }
}

/// Groups order quantities by normalized product key, largest groups first and
/// ties broken by name.
pub fn aggregate<'a, I>(entries: I) -> Aggregation
where
    I: IntoIterator<Item = (&'a Order, &'a ResolvedProduct)>,
{
    let mut total = 0u64;
    let mut usable: BTreeMap<String, u64> = BTreeMap::new();
    let mut unusable: Vec<(String, String, u64)> = Vec::new();

    for (order, product) in entries {
        let quantity = u64::from(order.quantity);
        total += quantity;
        let key = grouping_key(order, product);
        if has_known_model(&key) {
            *usable.entry(key).or_default() += quantity;
        } else {
            unusable.push((key, raw_name_key(order, product), quantity));
        }
    }

    let groups = if usable.is_empty() {
        // No title produced a recognisable model: group by the raw names instead.
        let mut by_raw: BTreeMap<String, u64> = BTreeMap::new();
        for (_, raw, quantity) in unusable {
            *by_raw.entry(raw).or_default() += quantity;
        }
        by_raw
    } else {
        for (key, _, quantity) in unusable {
            *usable.entry(key).or_default() += quantity;
        }
        usable
    };

    let mut lines: Vec<ReportLine> = groups
        .into_iter()
        .map(|(name, quantity)| ReportLine { name, quantity })
        .collect();
    lines.sort_by(|a, b| b.quantity.cmp(&a.quantity).then_with(|| a.name.cmp(&b.name)));

    Aggregation { total, lines }
}

/// Resolved color wins, then the order's own color code; with neither the key
/// has no color part at all.
fn grouping_key(order: &Order, product: &ResolvedProduct) -> String {
    let color = Some(product.color.trim())
        .filter(|c| !c.is_empty())
        .or_else(|| order.raw_color());
    match color {
        Some(color) => normalize(&format!("{} {}", product.title, color)),
        None => normalize(&product.title),
    }
}

fn raw_name_key(order: &Order, product: &ResolvedProduct) -> String {
    let name = match product.source {
        ResolutionSource::Synthetic => order.fallback_name().unwrap_or(&product.title),
        _ => product.title.as_str(),
    };
    let key = name.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        product.title.clone()
    } else {
        key
    }
}
