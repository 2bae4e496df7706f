//! Read-time allocation of the shared stock pool across client demand,
//! plus day-over-day trend annotation.
//!
//! Everything here is arithmetic over already-fetched rows; nothing is
//! persisted. Allocation is a simulation against a copy of the pool,
//! recomputed on every read.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::LedgerRow;

/// Several branch agent codes collapse into one regional client. A lookup
/// table, not logic; zero-padded variants cover an upstream quirk.
const CLIENT_MAPPING: &[(&str, &str)] = &[
    ("24", "FILIPPO"),
    ("27", "PINGÜINO"),
    ("26", "TENERIFE SUR"),
    ("23", "LA PALMA"),
    ("15", "TENERIFE NORTE"),
    ("10", "GRAN CANARIA"),
    ("14", "GRAN CANARIA"),
    ("5", "GRAN CANARIA"),
    ("05", "GRAN CANARIA"),
    ("0", "GRAN CANARIA"),
    ("00", "GRAN CANARIA"),
    ("8", "GRAN CANARIA"),
    ("08", "GRAN CANARIA"),
];

/// This client always sorts first and therefore gets first claim on scarce
/// stock. Business policy, not an accident of iteration order.
const FIRST_CLIENT: &str = "GRAN CANARIA";

pub(crate) fn client_label(agent_code: &str, agent_name: &str) -> String {
    if let Some((_, label)) = CLIENT_MAPPING.iter().find(|(c, _)| *c == agent_code) {
        return (*label).to_string();
    }
    if !agent_name.trim().is_empty() {
        return agent_name.trim().to_string();
    }
    format!("ZONA {agent_code}")
}

/// Percent change versus the prior day. Both periods zero reads as flat;
/// activity appearing out of nothing reads as +100 ("new"), not infinity.
pub(crate) fn trend_pct(prior: i64, current: i64) -> f64 {
    if prior == 0 {
        if current > 0 {
            100.0
        } else {
            0.0
        }
    } else {
        (current - prior) as f64 / prior as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProductView {
    pub(crate) code: String,
    pub(crate) name: String,
    pub(crate) qty: i64,
    pub(crate) yesterday_qty: i64,
    pub(crate) stock: i64,
    pub(crate) to_produce: i64,
    pub(crate) trend_pct: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientGroup {
    pub(crate) name: String,
    pub(crate) products: Vec<ProductView>,
    pub(crate) total_today: i64,
    pub(crate) total_yesterday: i64,
    pub(crate) trend_pct: f64,
}

/// Groups ledger rows by resolved client, walks clients in the fixed order
/// and greedily assigns the shared stock pool: earlier clients take first,
/// `to_produce` absorbs the shortfall. Product lists come out sorted by
/// today's quantity, largest first.
pub(crate) fn build_board(rows: &[LedgerRow]) -> Vec<ClientGroup> {
    let mut pool: HashMap<String, i64> = HashMap::new();
    let mut groups: HashMap<String, ClientGroup> = HashMap::new();

    for row in rows {
        if row.total_qty == 0 && row.yesterday_qty == 0 && row.global_stock == 0 {
            continue;
        }
        pool.insert(row.product_code.clone(), row.global_stock.max(0));

        let label = client_label(&row.agent_code, &row.agent_name);
        let group = groups.entry(label.clone()).or_insert_with(|| ClientGroup {
            name: label,
            products: Vec::new(),
            total_today: 0,
            total_yesterday: 0,
            trend_pct: 0.0,
        });

        // A client is the union of its agent codes, so the same product can
        // arrive from several rows and must sum.
        match group.products.iter_mut().find(|p| p.code == row.product_code) {
            Some(p) => {
                p.qty += row.total_qty;
                p.yesterday_qty += row.yesterday_qty;
            }
            None => group.products.push(ProductView {
                code: row.product_code.clone(),
                name: row.product_name.clone(),
                qty: row.total_qty,
                yesterday_qty: row.yesterday_qty,
                stock: 0,
                to_produce: 0,
                trend_pct: 0.0,
            }),
        }
        group.total_today += row.total_qty;
        group.total_yesterday += row.yesterday_qty;
    }

    let mut clients: Vec<ClientGroup> = groups.into_values().collect();
    clients.sort_by(|a, b| {
        if a.name == FIRST_CLIENT {
            std::cmp::Ordering::Less
        } else if b.name == FIRST_CLIENT {
            std::cmp::Ordering::Greater
        } else {
            a.name.cmp(&b.name)
        }
    });

    for client in &mut clients {
        client.trend_pct = trend_pct(client.total_yesterday, client.total_today);
        for p in &mut client.products {
            let available = pool.get(&p.code).copied().unwrap_or(0);
            let assigned = p.qty.min(available);
            p.stock = assigned;
            p.to_produce = (p.qty - assigned).max(0);
            p.trend_pct = trend_pct(p.yesterday_qty, p.qty);
            pool.insert(p.code.clone(), available - assigned);
        }
        client
            .products
            .sort_by(|a, b| b.qty.cmp(&a.qty).then_with(|| a.code.cmp(&b.code)));
    }

    clients.retain(|c| c.total_today > 0);
    clients
}
