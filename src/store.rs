//! Ledger persistence: schema bootstrap, snapshot reconciliation, stock
//! mutation and the two-day read model.
//!
//! Reconciliation is split in two: `build_plan` is pure (normalize lines,
//! derive record keys, build per-agent seen sets) and `apply_plan` runs the
//! whole plan inside one serializable transaction. Replaying the same
//! snapshot is a no-op by construction: upserts overwrite, they never add.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};

use crate::normalize::{clean_code, final_units, parse_boxes};

pub(crate) async fn init_schema(db: &Pool<Postgres>) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            record_key TEXT PRIMARY KEY,
            agent_code TEXT NOT NULL,
            agent_name TEXT NOT NULL DEFAULT '',
            product_code TEXT NOT NULL,
            product_name TEXT NOT NULL DEFAULT '',
            quantity BIGINT NOT NULL DEFAULT 0,
            recorded_day DATE NOT NULL,
            received_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(db)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_agent_day ON orders (agent_code, recorded_day)")
        .execute(db)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_day ON orders (recorded_day)")
        .execute(db)
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inventory (
            product_code TEXT PRIMARY KEY,
            stock_units BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(db)
    .await?;
    Ok(())
}

// ===== Snapshot payload (wire names come from the upstream export) =====

#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotPayload {
    #[serde(rename = "zonas")]
    pub(crate) zones: Vec<ZoneSnapshot>,
}

impl SnapshotPayload {
    /// Validates the payload shape before anything touches the database; a
    /// missing or non-array `zonas` is a client error, not a 500. The serde
    /// definition is the single source of truth for what is well-formed.
    pub(crate) fn from_value(body: serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(body).map_err(|e| format!("invalid snapshot payload: {e}"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ZoneSnapshot {
    #[serde(rename = "codigo_agente", default)]
    pub(crate) agent_code: serde_json::Value,
    #[serde(rename = "nombre_agente", default)]
    pub(crate) agent_name: Option<String>,
    #[serde(rename = "nombre_comercial", default)]
    pub(crate) trade_name: Option<String>,
    #[serde(rename = "productos", default)]
    pub(crate) products: Vec<ProductLine>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ProductLine {
    #[serde(rename = "codigo", default)]
    pub(crate) code: String,
    #[serde(rename = "nombre_producto", default)]
    pub(crate) name: String,
    #[serde(rename = "cantidad", default)]
    pub(crate) quantity: serde_json::Value,
    /// Optional physical count riding along with the order line; when
    /// present it is the count of record and overwrites the stock row.
    #[serde(rename = "stock_fisico", default)]
    pub(crate) stock_level: Option<serde_json::Value>,
}

/// The upstream sends agent codes as strings or bare numbers; zero is a
/// legitimate code and must not collapse to empty.
fn coerce_agent_code(raw: &serde_json::Value) -> String {
    let s = match raw {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    if s.is_empty() {
        "0".to_string()
    } else {
        s
    }
}

// ===== Reconciliation plan =====

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedLine {
    pub(crate) record_key: String,
    pub(crate) agent_code: String,
    pub(crate) agent_name: String,
    pub(crate) product_code: String,
    pub(crate) product_name: String,
    pub(crate) quantity_units: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReconcilePlan {
    pub(crate) day: NaiveDate,
    /// Keyed by record key; a repeated line within one snapshot overwrites.
    pub(crate) lines: BTreeMap<String, PlannedLine>,
    /// Snapshot-carried physical counts, product code -> units.
    pub(crate) stock_levels: BTreeMap<String, i64>,
    /// Agent code -> record keys present in this snapshot. An agent with an
    /// empty set still gets its day-rows cleaned ("now has nothing" is not
    /// the same as "not mentioned").
    pub(crate) seen: BTreeMap<String, BTreeSet<String>>,
    pub(crate) last_code: Option<String>,
}

pub(crate) fn record_key(agent_code: &str, product_code: &str, day: NaiveDate) -> String {
    format!("{agent_code}-{product_code}-{day}")
}

/// The deletion decision: a persisted (agent, record_key) pair is removed
/// when the agent appears in this snapshot but the key does not. Agents the
/// snapshot never mentions keep all their rows.
pub(crate) fn keys_to_delete(
    existing: &[(String, String)],
    seen: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    existing
        .iter()
        .filter(|(agent, key)| seen.get(agent).is_some_and(|keys| !keys.contains(key)))
        .map(|(_, key)| key.clone())
        .collect()
}

pub(crate) fn build_plan(payload: &SnapshotPayload, day: NaiveDate) -> ReconcilePlan {
    let mut plan = ReconcilePlan {
        day,
        lines: BTreeMap::new(),
        stock_levels: BTreeMap::new(),
        seen: BTreeMap::new(),
        last_code: None,
    };

    for zone in &payload.zones {
        let agent_code = coerce_agent_code(&zone.agent_code);
        let agent_name = zone
            .agent_name
            .as_deref()
            .or(zone.trade_name.as_deref())
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "DESCONOCIDO".to_string());
        let seen = plan.seen.entry(agent_code.clone()).or_default();

        for product in &zone.products {
            let product_code = clean_code(&product.code);
            if product_code.is_empty() {
                continue;
            }
            plan.last_code = Some(product_code.clone());

            if let Some(raw_stock) = &product.stock_level {
                plan.stock_levels
                    .insert(product_code.clone(), parse_boxes(raw_stock));
            }

            let quantity_units = final_units(&product_code, &product.quantity);
            if quantity_units == 0 {
                // A floored-to-zero line counts as absent; the scoped delete
                // below will drop any stale row for this key.
                continue;
            }

            let key = record_key(&agent_code, &product_code, day);
            seen.insert(key.clone());
            plan.lines.insert(
                key.clone(),
                PlannedLine {
                    record_key: key,
                    agent_code: agent_code.clone(),
                    agent_name: agent_name.clone(),
                    product_code,
                    product_name: product.name.trim().to_uppercase(),
                    quantity_units,
                },
            );
        }
    }
    plan
}

// ===== Apply =====

#[derive(Debug, Default, Serialize, PartialEq)]
pub(crate) struct ReconcileSummary {
    pub(crate) inserted: u64,
    pub(crate) updated: u64,
    pub(crate) deleted: u64,
}

/// Runs the whole plan inside one serializable transaction: upsert every
/// line (overwrite quantity, never accumulate), apply snapshot stock
/// counts, then delete each mentioned agent's day-rows that the snapshot
/// no longer contains. Any failure rolls the batch back untouched.
pub(crate) async fn apply_plan(
    db: &Pool<Postgres>,
    plan: &ReconcilePlan,
) -> Result<ReconcileSummary, sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;

    let agents: Vec<String> = plan.seen.keys().cloned().collect();
    let existing: Vec<(String, String)> = if agents.is_empty() {
        Vec::new()
    } else {
        sqlx::query_as(
            "SELECT agent_code, record_key FROM orders WHERE recorded_day = $1 AND agent_code = ANY($2)",
        )
        .bind(plan.day)
        .bind(&agents)
        .fetch_all(&mut *tx)
        .await?
    };
    let existing_keys: BTreeSet<&String> = existing.iter().map(|(_, key)| key).collect();

    let mut summary = ReconcileSummary::default();
    for line in plan.lines.values() {
        sqlx::query(
            r#"
            INSERT INTO orders (record_key, agent_code, agent_name, product_code, product_name, quantity, recorded_day)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (record_key) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                product_name = EXCLUDED.product_name,
                agent_name = EXCLUDED.agent_name,
                received_at = now()
            "#,
        )
        .bind(&line.record_key)
        .bind(&line.agent_code)
        .bind(&line.agent_name)
        .bind(&line.product_code)
        .bind(&line.product_name)
        .bind(line.quantity_units)
        .bind(plan.day)
        .execute(&mut *tx)
        .await?;
        if existing_keys.contains(&line.record_key) {
            summary.updated += 1;
        } else {
            summary.inserted += 1;
        }
    }

    for (product_code, stock_units) in &plan.stock_levels {
        sqlx::query(
            r#"
            INSERT INTO inventory (product_code, stock_units)
            VALUES ($1, $2)
            ON CONFLICT (product_code) DO UPDATE SET stock_units = EXCLUDED.stock_units
            "#,
        )
        .bind(product_code)
        .bind(stock_units)
        .execute(&mut *tx)
        .await?;
    }

    let stale = keys_to_delete(&existing, &plan.seen);
    if !stale.is_empty() {
        let res = sqlx::query("DELETE FROM orders WHERE recorded_day = $1 AND record_key = ANY($2)")
            .bind(plan.day)
            .bind(&stale)
            .execute(&mut *tx)
            .await?;
        summary.deleted = res.rows_affected();
    }

    tx.commit().await?;
    Ok(summary)
}

// ===== Stock mutation / reset =====

/// Additive stock mutation from the scan collaborator. The balance never
/// goes below zero.
pub(crate) async fn adjust_stock(
    db: &Pool<Postgres>,
    product_code: &str,
    delta_units: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO inventory (product_code, stock_units)
        VALUES ($1, GREATEST($2, 0))
        ON CONFLICT (product_code) DO UPDATE SET
            stock_units = GREATEST(inventory.stock_units + $2, 0)
        RETURNING stock_units
        "#,
    )
    .bind(product_code)
    .bind(delta_units)
    .fetch_one(db)
    .await
}

pub(crate) async fn reset_all(db: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query("TRUNCATE TABLE orders, inventory")
        .execute(db)
        .await?;
    Ok(())
}

// ===== Read model =====

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub(crate) struct LedgerRow {
    pub(crate) agent_code: String,
    pub(crate) agent_name: String,
    pub(crate) product_code: String,
    pub(crate) product_name: String,
    pub(crate) total_qty: i64,
    pub(crate) yesterday_qty: i64,
    pub(crate) global_stock: i64,
}

/// Rows for the two most recent distinct ledger days, one row per
/// (agent, product) with today / prior-day totals and the shared stock
/// pool joined in. Older days fall out of view by never being selected.
pub(crate) async fn fetch_board_rows(db: &Pool<Postgres>) -> Result<Vec<LedgerRow>, sqlx::Error> {
    let days: Vec<NaiveDate> =
        sqlx::query_scalar("SELECT DISTINCT recorded_day FROM orders ORDER BY recorded_day DESC LIMIT 2")
            .fetch_all(db)
            .await?;
    let Some(latest) = days.first().copied() else {
        return Ok(Vec::new());
    };
    let prior: Option<NaiveDate> = days.get(1).copied();

    sqlx::query_as(
        r#"
        SELECT
            o.agent_code,
            o.agent_name,
            o.product_code,
            o.product_name,
            COALESCE(SUM(o.quantity) FILTER (WHERE o.recorded_day = $1), 0)::BIGINT AS total_qty,
            COALESCE(SUM(o.quantity) FILTER (WHERE o.recorded_day = $2), 0)::BIGINT AS yesterday_qty,
            COALESCE(MAX(i.stock_units), 0)::BIGINT AS global_stock
        FROM orders o
        LEFT JOIN inventory i ON i.product_code = o.product_code
        WHERE o.recorded_day = $1 OR o.recorded_day = $2
        GROUP BY o.agent_code, o.agent_name, o.product_code, o.product_name
        ORDER BY o.agent_code ASC, o.product_name ASC
        "#,
    )
    .bind(latest)
    .bind(prior)
    .fetch_all(db)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 23).unwrap()
    }

    fn payload(v: serde_json::Value) -> SnapshotPayload {
        SnapshotPayload::from_value(v).unwrap()
    }

    #[test]
    fn top_level_shape_is_validated_before_parsing() {
        assert!(SnapshotPayload::from_value(json!({})).is_err());
        assert!(SnapshotPayload::from_value(json!({"zonas": "nope"})).is_err());
        assert!(SnapshotPayload::from_value(json!({"zonas": []})).is_ok());
    }

    #[test]
    fn plan_multiplies_boxes_into_units() {
        // Agent "10" ordering 2 boxes of MOZ30 (9 units per box) -> 18 units.
        let p = payload(json!({"zonas": [{
            "codigo_agente": "10",
            "nombre_agente": "norte",
            "productos": [{"codigo": "moz30", "nombre_producto": "Mozzarella", "cantidad": 2}]
        }]}));
        let plan = build_plan(&p, day());
        let key = "10-MOZ30-2026-08-23";
        let line = &plan.lines[key];
        assert_eq!(line.quantity_units, 18);
        assert_eq!(line.agent_name, "NORTE");
        assert_eq!(line.product_name, "MOZZARELLA");
        assert!(plan.seen["10"].contains(key));
    }

    #[test]
    fn plan_is_idempotent() {
        let p = payload(json!({"zonas": [{
            "codigo_agente": "24",
            "productos": [
                {"codigo": "RIC3", "cantidad": "1,5"},
                {"codigo": "BUR4", "cantidad": 3}
            ]
        }]}));
        assert_eq!(build_plan(&p, day()), build_plan(&p, day()));
    }

    #[test]
    fn repeated_line_overwrites_within_one_snapshot() {
        let p = payload(json!({"zonas": [{
            "codigo_agente": "24",
            "productos": [
                {"codigo": "BUR4", "cantidad": 3},
                {"codigo": "BUR4", "cantidad": 5}
            ]
        }]}));
        let plan = build_plan(&p, day());
        assert_eq!(plan.lines.len(), 1);
        // Last occurrence wins; BUR4 packs 2 units per box.
        assert_eq!(plan.lines["24-BUR4-2026-08-23"].quantity_units, 10);
    }

    #[test]
    fn zero_unit_lines_count_as_absent() {
        let p = payload(json!({"zonas": [{
            "codigo_agente": "15",
            "productos": [
                {"codigo": "MOZ5", "cantidad": "0,9"},
                {"codigo": "MOZ8", "cantidad": "abc"}
            ]
        }]}));
        let plan = build_plan(&p, day());
        assert!(plan.lines.is_empty());
        // The agent is still mentioned, so its stale day-rows get cleaned.
        assert!(plan.seen["15"].is_empty());
    }

    #[test]
    fn empty_product_list_still_scopes_the_agent() {
        let p = payload(json!({"zonas": [{"codigo_agente": "27", "productos": []}]}));
        let plan = build_plan(&p, day());
        assert!(plan.lines.is_empty());
        assert_eq!(plan.seen.get("27"), Some(&BTreeSet::new()));
    }

    fn ledger(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, k)| ((*a).to_string(), (*k).to_string()))
            .collect()
    }

    #[test]
    fn omitting_a_line_marks_its_key_deleted() {
        // Yesterday's snapshot wrote MOZ30 for agent 10; today's snapshot
        // for the same agent carries only RIC3, so MOZ30 must go.
        let p = payload(json!({"zonas": [{
            "codigo_agente": "10",
            "productos": [{"codigo": "RIC3", "cantidad": 1}]
        }]}));
        let plan = build_plan(&p, day());
        let existing = ledger(&[
            ("10", "10-MOZ30-2026-08-23"),
            ("10", "10-RIC3-2026-08-23"),
        ]);
        assert_eq!(
            keys_to_delete(&existing, &plan.seen),
            vec!["10-MOZ30-2026-08-23".to_string()]
        );
    }

    #[test]
    fn agents_not_in_the_snapshot_keep_their_rows() {
        let p = payload(json!({"zonas": [{
            "codigo_agente": "10",
            "productos": [{"codigo": "RIC3", "cantidad": 1}]
        }]}));
        let plan = build_plan(&p, day());
        let existing = ledger(&[
            ("24", "24-MOZ30-2026-08-23"),
            ("24", "24-RIC3-2026-08-23"),
        ]);
        assert!(keys_to_delete(&existing, &plan.seen).is_empty());
    }

    #[test]
    fn agent_with_empty_products_gets_its_day_wiped() {
        // "Now has nothing" is explicit: every persisted row for that agent
        // and day is stale. Other agents stay untouched.
        let p = payload(json!({"zonas": [{"codigo_agente": "27", "productos": []}]}));
        let plan = build_plan(&p, day());
        let existing = ledger(&[
            ("27", "27-BUR4-2026-08-23"),
            ("27", "27-MOZ5-2026-08-23"),
            ("15", "15-MOZ5-2026-08-23"),
        ]);
        assert_eq!(
            keys_to_delete(&existing, &plan.seen),
            vec![
                "27-BUR4-2026-08-23".to_string(),
                "27-MOZ5-2026-08-23".to_string()
            ]
        );
    }

    #[test]
    fn replaying_the_same_snapshot_deletes_nothing() {
        // Ledger already matches the snapshot 1:1; the delete set is empty
        // and every line is a pure overwrite.
        let p = payload(json!({"zonas": [{
            "codigo_agente": "10",
            "productos": [
                {"codigo": "MOZ30", "cantidad": 2},
                {"codigo": "RIC3", "cantidad": 1}
            ]
        }]}));
        let plan = build_plan(&p, day());
        let existing: Vec<(String, String)> = plan
            .lines
            .values()
            .map(|l| (l.agent_code.clone(), l.record_key.clone()))
            .collect();
        assert!(keys_to_delete(&existing, &plan.seen).is_empty());
    }

    #[test]
    fn numeric_agent_codes_are_coerced() {
        let p = payload(json!({"zonas": [
            {"codigo_agente": 0, "productos": [{"codigo": "RIC3", "cantidad": 1}]},
            {"productos": [{"codigo": "BUR5", "cantidad": 1}]}
        ]}));
        let plan = build_plan(&p, day());
        assert!(plan.seen.contains_key("0"));
        assert_eq!(plan.seen.len(), 1);
        assert_eq!(plan.lines.len(), 2);
    }

    #[test]
    fn snapshot_stock_counts_are_captured() {
        let p = payload(json!({"zonas": [{
            "codigo_agente": "10",
            "productos": [{"codigo": "MOZ30", "cantidad": 1, "stock_fisico": "12,7"}]
        }]}));
        let plan = build_plan(&p, day());
        assert_eq!(plan.stock_levels.get("MOZ30"), Some(&12));
    }

    #[test]
    fn agent_name_falls_back_to_trade_name() {
        let p = payload(json!({"zonas": [{
            "codigo_agente": "26",
            "nombre_comercial": "sur",
            "productos": [{"codigo": "MOH1", "cantidad": 1}]
        }]}));
        let plan = build_plan(&p, day());
        assert_eq!(plan.lines["26-MOH1-2026-08-23"].agent_name, "SUR");
    }
}
