//! PostgreSQL store. Schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::config::StoreConfig;
use crate::demand::DemandFactorPoint;
use crate::domain::{
    parse_label, BusSection, CableCatalog, Circuit, CircuitCalc, CircuitId, Consumer, Feed, FeedRoleId,
    LegacyFeedRole, LoadReference, LoadRow, ManualLoad, Mode, ModeRule, Panel, PanelCalc, PanelId,
    PanelPhaseBalance, PhaseAssignment, PhaseTotals, RowCalc, SectionCalc, SectionLoad, SelectionMethod,
    Subsystem, TouchLookup, TouchScope,
};
use crate::error::{CalcError, CalcResult, CalcWarning};

pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &StoreConfig) -> CalcResult<Self> {
        let url = cfg
            .url
            .as_deref()
            .ok_or_else(|| CalcError::validation("store.url is not configured"))?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> CalcResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx, dirty: false }))
    }

    async fn data_version(&self) -> CalcResult<u64> {
        let revision: Option<i64> = sqlx::query_scalar("SELECT revision FROM store_revision WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(revision.unwrap_or(0).max(0) as u64)
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PanelRow {
    id: Uuid,
    name: String,
    system_type: String,
    u_ll_v: Option<f64>,
    u_ph_v: Option<f64>,
    du_limit_lighting_pct: f64,
    du_limit_other_pct: f64,
}

impl TryFrom<PanelRow> for Panel {
    type Error = CalcError;

    fn try_from(row: PanelRow) -> CalcResult<Self> {
        Ok(Panel {
            id: row.id.into(),
            name: row.name,
            system_type: parse_label("system_type", &row.system_type)?,
            u_ll_v: row.u_ll_v,
            u_ph_v: row.u_ph_v,
            du_limit_lighting_pct: row.du_limit_lighting_pct,
            du_limit_other_pct: row.du_limit_other_pct,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LoadRowRow {
    id: Uuid,
    panel_id: Uuid,
    name: String,
    quantity: i64,
    unit_power_kw: f64,
    ki: f64,
    cos_phi: Option<f64>,
    tg_phi: Option<f64>,
    phases: i16,
    phase_mode: String,
    phase_fixed: Option<String>,
}

impl TryFrom<LoadRowRow> for LoadRow {
    type Error = CalcError;

    fn try_from(row: LoadRowRow) -> CalcResult<Self> {
        Ok(LoadRow {
            id: row.id.into(),
            panel_id: row.panel_id.into(),
            name: row.name,
            quantity: row.quantity,
            unit_power_kw: row.unit_power_kw,
            ki: row.ki,
            cos_phi: row.cos_phi,
            tg_phi: row.tg_phi,
            phases: phase_count(row.phases)?,
            phase_mode: parse_label("phase_mode", &row.phase_mode)?,
            phase_fixed: row
                .phase_fixed
                .as_deref()
                .map(|p| parse_label("phase_fixed", p))
                .transpose()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CircuitRow {
    id: Uuid,
    panel_id: Uuid,
    name: String,
    phases: i16,
    unbalance_mode: String,
    length_m: f64,
    material: String,
    cos_phi: f64,
    load_kind: String,
    current_a: Option<f64>,
    phase: Option<String>,
    phase_source: String,
    bus_section_id: Option<Uuid>,
}

impl TryFrom<CircuitRow> for Circuit {
    type Error = CalcError;

    fn try_from(row: CircuitRow) -> CalcResult<Self> {
        Ok(Circuit {
            id: row.id.into(),
            panel_id: row.panel_id.into(),
            name: row.name,
            phases: phase_count(row.phases)?,
            unbalance_mode: parse_label("unbalance_mode", &row.unbalance_mode)?,
            length_m: row.length_m,
            material: parse_label("material", &row.material)?,
            cos_phi: row.cos_phi,
            load_kind: parse_label("load_kind", &row.load_kind)?,
            current_a: row.current_a,
            phase: row.phase,
            phase_source: parse_label("phase_source", &row.phase_source)?,
            bus_section_id: row.bus_section_id.map(Into::into),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConsumerRow {
    id: Uuid,
    panel_id: Uuid,
    name: String,
    load_ref_type: String,
    load_ref_id: Option<Uuid>,
    p_kw: Option<f64>,
    q_kvar: Option<f64>,
    s_kva: Option<f64>,
    i_a: Option<f64>,
}

impl TryFrom<ConsumerRow> for Consumer {
    type Error = CalcError;

    fn try_from(row: ConsumerRow) -> CalcResult<Self> {
        let missing_ref = || {
            CalcError::validation(format!(
                "Consumer {}: {} reference without target",
                row.name, row.load_ref_type
            ))
        };
        let load = match row.load_ref_type.trim().to_ascii_uppercase().as_str() {
            "RTM_PANEL" => LoadReference::RtmPanel {
                panel_id: row.load_ref_id.ok_or_else(missing_ref)?.into(),
            },
            "RTM_ROW" => LoadReference::RtmRow {
                row_id: row.load_ref_id.ok_or_else(missing_ref)?.into(),
            },
            "MANUAL" => LoadReference::Manual(ManualLoad {
                p_kw: row.p_kw,
                q_kvar: row.q_kvar,
                s_kva: row.s_kva,
                i_a: row.i_a,
            }),
            other => {
                return Err(CalcError::validation(format!(
                    "Consumer {}: invalid load_ref_type {:?}",
                    row.name, other
                )))
            }
        };
        Ok(Consumer {
            id: row.id.into(),
            panel_id: row.panel_id.into(),
            name: row.name,
            load,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FeedRow {
    id: Uuid,
    consumer_id: Uuid,
    bus_section_id: Uuid,
    feed_role: Option<String>,
    feed_role_id: Option<String>,
    priority: i32,
}

impl TryFrom<FeedRow> for Feed {
    type Error = CalcError;

    fn try_from(row: FeedRow) -> CalcResult<Self> {
        Ok(Feed {
            id: row.id.into(),
            consumer_id: row.consumer_id.into(),
            bus_section_id: row.bus_section_id.into(),
            legacy_role: row
                .feed_role
                .as_deref()
                .map(|raw| parse_label::<LegacyFeedRole>("feed_role", raw))
                .transpose()?,
            role_id: row.feed_role_id.map(FeedRoleId::new),
            priority: row.priority,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PanelCalcRow {
    panel_id: Uuid,
    sum_pn_kw: f64,
    sum_ki_pn_kw: f64,
    sum_ki_pn_tg_kvar: f64,
    sum_n_pn2: f64,
    ne: f64,
    ne_tab: i32,
    ki_group: f64,
    kr: f64,
    pp_kw: f64,
    qp_kvar: f64,
    sp_kva: f64,
    ip_a: f64,
    updated_at: DateTime<Utc>,
}

impl From<PanelCalcRow> for PanelCalc {
    fn from(row: PanelCalcRow) -> Self {
        PanelCalc {
            panel_id: row.panel_id.into(),
            sum_pn_kw: row.sum_pn_kw,
            sum_ki_pn_kw: row.sum_ki_pn_kw,
            sum_ki_pn_tg_kvar: row.sum_ki_pn_tg_kvar,
            sum_n_pn2: row.sum_n_pn2,
            ne: row.ne,
            ne_tab: row.ne_tab.max(0) as u32,
            ki_group: row.ki_group,
            kr: row.kr,
            pp_kw: row.pp_kw,
            qp_kvar: row.qp_kvar,
            sp_kva: row.sp_kva,
            ip_a: row.ip_a,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CircuitCalcRow {
    circuit_id: Uuid,
    i_calc_a: f64,
    du_v: f64,
    du_pct: f64,
    du_limit_pct: f64,
    s_mm2_selected: f64,
    method: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CircuitCalcRow> for CircuitCalc {
    type Error = CalcError;

    fn try_from(row: CircuitCalcRow) -> CalcResult<Self> {
        Ok(CircuitCalc {
            circuit_id: row.circuit_id.into(),
            i_calc_a: row.i_calc_a,
            du_v: row.du_v,
            du_pct: row.du_pct,
            du_limit_pct: row.du_limit_pct,
            s_mm2_selected: row.s_mm2_selected,
            method: parse_label::<SelectionMethod>("method", &row.method)?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SectionCalcRow {
    panel_id: Uuid,
    bus_section_id: Uuid,
    mode: String,
    p_kw: f64,
    q_kvar: f64,
    s_kva: f64,
    i_a: f64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SectionCalcRow> for SectionCalc {
    type Error = CalcError;

    fn try_from(row: SectionCalcRow) -> CalcResult<Self> {
        Ok(SectionCalc {
            panel_id: row.panel_id.into(),
            bus_section_id: row.bus_section_id.into(),
            mode: Mode::parse(&row.mode)?,
            load: SectionLoad {
                p_kw: row.p_kw,
                q_kvar: row.q_kvar,
                s_kva: row.s_kva,
                i_a: row.i_a,
            },
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PhaseBalanceRow {
    panel_id: Uuid,
    mode: String,
    i_l1_a: f64,
    i_l2_a: f64,
    i_l3_a: f64,
    unbalance_pct: f64,
    invalid_manual_count: i32,
    warnings_json: Option<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PhaseBalanceRow> for PanelPhaseBalance {
    type Error = CalcError;

    fn try_from(row: PhaseBalanceRow) -> CalcResult<Self> {
        let warnings: Vec<CalcWarning> = match row.warnings_json {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| CalcError::validation(format!("Invalid phase balance warnings: {}", e)))?,
            None => Vec::new(),
        };
        Ok(PanelPhaseBalance {
            panel_id: row.panel_id.into(),
            mode: Mode::parse(&row.mode)?,
            totals: PhaseTotals {
                l1_a: row.i_l1_a,
                l2_a: row.i_l2_a,
                l3_a: row.i_l3_a,
            },
            unbalance_pct: row.unbalance_pct,
            invalid_manual_count: row.invalid_manual_count.max(0) as u32,
            warnings,
            updated_at: row.updated_at,
        })
    }
}

fn phase_count(raw: i16) -> CalcResult<u8> {
    match raw {
        1 | 3 => Ok(raw as u8),
        other => Err(CalcError::validation(format!("phases must be 1 or 3, got {}", other))),
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> CalcResult<Vec<T>>
where
    T: TryFrom<R, Error = CalcError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================================
// Transaction
// ============================================================================

struct PgTx {
    tx: Transaction<'static, Postgres>,
    dirty: bool,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn panel(&mut self, panel_id: PanelId) -> CalcResult<Option<Panel>> {
        let row: Option<PanelRow> = sqlx::query_as(
            r#"
            SELECT id, name, system_type, u_ll_v, u_ph_v, du_limit_lighting_pct, du_limit_other_pct
            FROM panels
            WHERE id = $1
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Panel::try_from).transpose()
    }

    async fn load_rows(&mut self, panel_id: PanelId) -> CalcResult<Vec<LoadRow>> {
        let rows: Vec<LoadRowRow> = sqlx::query_as(
            r#"
            SELECT id, panel_id, name, quantity, unit_power_kw, ki, cos_phi, tg_phi,
                   phases, phase_mode, phase_fixed
            FROM load_rows
            WHERE panel_id = $1
            ORDER BY id
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn circuit(&mut self, circuit_id: CircuitId) -> CalcResult<Option<Circuit>> {
        let row: Option<CircuitRow> = sqlx::query_as(
            r#"
            SELECT id, panel_id, name, phases, unbalance_mode, length_m, material, cos_phi,
                   load_kind, current_a, phase, phase_source, bus_section_id
            FROM circuits
            WHERE id = $1
            "#,
        )
        .bind(circuit_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Circuit::try_from).transpose()
    }

    async fn circuits(&mut self, panel_id: PanelId) -> CalcResult<Vec<Circuit>> {
        let rows: Vec<CircuitRow> = sqlx::query_as(
            r#"
            SELECT id, panel_id, name, phases, unbalance_mode, length_m, material, cos_phi,
                   load_kind, current_a, phase, phase_source, bus_section_id
            FROM circuits
            WHERE panel_id = $1
            ORDER BY name, id
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn cable_catalog(&mut self) -> CalcResult<CableCatalog> {
        let sections: Vec<f64> = sqlx::query_scalar("SELECT s_mm2 FROM cable_sections ORDER BY s_mm2")
            .fetch_all(&mut *self.tx)
            .await?;
        CableCatalog::new(sections)
    }

    async fn bus_sections(&mut self, panel_id: PanelId) -> CalcResult<Vec<BusSection>> {
        let rows: Vec<(Uuid, Uuid, String, i32)> = sqlx::query_as(
            "SELECT id, panel_id, name, sort_order FROM bus_sections WHERE panel_id = $1 ORDER BY sort_order, name",
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, panel_id, name, order)| BusSection {
                id: id.into(),
                panel_id: panel_id.into(),
                name,
                order,
            })
            .collect())
    }

    async fn consumers(&mut self, panel_id: PanelId) -> CalcResult<Vec<Consumer>> {
        let rows: Vec<ConsumerRow> = sqlx::query_as(
            r#"
            SELECT id, panel_id, name, load_ref_type, load_ref_id, p_kw, q_kvar, s_kva, i_a
            FROM consumers
            WHERE panel_id = $1
            ORDER BY name, id
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn feeds(&mut self, panel_id: PanelId) -> CalcResult<Vec<Feed>> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            r#"
            SELECT f.id, f.consumer_id, f.bus_section_id, f.feed_role, f.feed_role_id, f.priority
            FROM consumer_feeds f
            JOIN consumers c ON c.id = f.consumer_id
            WHERE c.panel_id = $1
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn mode_rules(&mut self, panel_id: PanelId) -> CalcResult<Vec<ModeRule>> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT r.consumer_id, r.mode, r.active_feed_role_id
            FROM consumer_mode_rules r
            JOIN consumers c ON c.id = r.consumer_id
            WHERE c.panel_id = $1
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter()
            .map(|(consumer_id, mode, role)| {
                Ok(ModeRule {
                    consumer_id: consumer_id.into(),
                    mode: Mode::parse(&mode)?,
                    active_role: FeedRoleId::new(role),
                })
            })
            .collect()
    }

    async fn demand_factor_points(&mut self) -> CalcResult<Vec<DemandFactorPoint>> {
        let rows: Vec<(i32, f64, f64)> = sqlx::query_as("SELECT ne, ki, kr FROM demand_factor_table ORDER BY ne, ki")
            .fetch_all(&mut *self.tx)
            .await?;
        rows.into_iter()
            .map(|(ne, ki, kr)| {
                let ne = u32::try_from(ne)
                    .map_err(|_| CalcError::validation(format!("Demand factor table: invalid ne {}", ne)))?;
                Ok(DemandFactorPoint { ne, ki, kr })
            })
            .collect()
    }

    async fn input_touch(&mut self, scope: TouchScope, subsystem: Subsystem) -> CalcResult<TouchLookup> {
        let available: bool = sqlx::query_scalar("SELECT to_regclass('input_touch_log') IS NOT NULL")
            .fetch_one(&mut *self.tx)
            .await?;
        if !available {
            return Ok(TouchLookup::Unavailable);
        }
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT last_input_at FROM input_touch_log WHERE scope = $1 AND subsystem = $2",
        )
        .bind(scope.key())
        .bind(subsystem.as_ref())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(raw.map_or(TouchLookup::NotRecorded, TouchLookup::Recorded))
    }

    async fn row_calcs(&mut self, panel_id: PanelId) -> CalcResult<Vec<RowCalc>> {
        let rows: Vec<(Uuid, f64, f64, f64, f64)> = sqlx::query_as(
            r#"
            SELECT rc.row_id, rc.pn_total_kw, rc.ki_pn_kw, rc.ki_pn_tg_kvar, rc.n_pn2
            FROM row_calcs rc
            JOIN load_rows r ON r.id = rc.row_id
            WHERE r.panel_id = $1
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(row_id, pn_total_kw, ki_pn_kw, ki_pn_tg_kvar, n_pn2)| RowCalc {
                row_id: row_id.into(),
                pn_total_kw,
                ki_pn_kw,
                ki_pn_tg_kvar,
                n_pn2,
            })
            .collect())
    }

    async fn panel_calc(&mut self, panel_id: PanelId) -> CalcResult<Option<PanelCalc>> {
        let row: Option<PanelCalcRow> = sqlx::query_as(
            r#"
            SELECT panel_id, sum_pn_kw, sum_ki_pn_kw, sum_ki_pn_tg_kvar, sum_n_pn2, ne, ne_tab,
                   ki_group, kr, pp_kw, qp_kvar, sp_kva, ip_a, updated_at
            FROM panel_calcs
            WHERE panel_id = $1
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(PanelCalc::from))
    }

    async fn circuit_calcs(&mut self, panel_id: PanelId) -> CalcResult<Vec<CircuitCalc>> {
        let rows: Vec<CircuitCalcRow> = sqlx::query_as(
            r#"
            SELECT cc.circuit_id, cc.i_calc_a, cc.du_v, cc.du_pct, cc.du_limit_pct,
                   cc.s_mm2_selected, cc.method, cc.updated_at
            FROM circuit_calcs cc
            JOIN circuits c ON c.id = cc.circuit_id
            WHERE c.panel_id = $1
            "#,
        )
        .bind(panel_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn section_calcs(&mut self, panel_id: PanelId, mode: Mode) -> CalcResult<Vec<SectionCalc>> {
        let rows: Vec<SectionCalcRow> = sqlx::query_as(
            r#"
            SELECT panel_id, bus_section_id, mode, p_kw, q_kvar, s_kva, i_a, updated_at
            FROM section_calcs
            WHERE panel_id = $1 AND mode = $2
            "#,
        )
        .bind(panel_id.as_uuid())
        .bind(mode.as_ref())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn phase_balance(&mut self, panel_id: PanelId, mode: Mode) -> CalcResult<Option<PanelPhaseBalance>> {
        let row: Option<PhaseBalanceRow> = sqlx::query_as(
            r#"
            SELECT panel_id, mode, i_l1_a, i_l2_a, i_l3_a, unbalance_pct, invalid_manual_count,
                   warnings_json, updated_at
            FROM panel_phase_balance
            WHERE panel_id = $1 AND mode = $2
            "#,
        )
        .bind(panel_id.as_uuid())
        .bind(mode.as_ref())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(PanelPhaseBalance::try_from).transpose()
    }

    async fn replace_demand(&mut self, rows: &[RowCalc], panel: &PanelCalc) -> CalcResult<()> {
        self.dirty = true;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO row_calcs (row_id, pn_total_kw, ki_pn_kw, ki_pn_tg_kvar, n_pn2)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (row_id) DO UPDATE SET
                    pn_total_kw = EXCLUDED.pn_total_kw,
                    ki_pn_kw = EXCLUDED.ki_pn_kw,
                    ki_pn_tg_kvar = EXCLUDED.ki_pn_tg_kvar,
                    n_pn2 = EXCLUDED.n_pn2
                "#,
            )
            .bind(row.row_id.as_uuid())
            .bind(row.pn_total_kw)
            .bind(row.ki_pn_kw)
            .bind(row.ki_pn_tg_kvar)
            .bind(row.n_pn2)
            .execute(&mut *self.tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO panel_calcs (panel_id, sum_pn_kw, sum_ki_pn_kw, sum_ki_pn_tg_kvar, sum_n_pn2,
                                     ne, ne_tab, ki_group, kr, pp_kw, qp_kvar, sp_kva, ip_a, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (panel_id) DO UPDATE SET
                sum_pn_kw = EXCLUDED.sum_pn_kw,
                sum_ki_pn_kw = EXCLUDED.sum_ki_pn_kw,
                sum_ki_pn_tg_kvar = EXCLUDED.sum_ki_pn_tg_kvar,
                sum_n_pn2 = EXCLUDED.sum_n_pn2,
                ne = EXCLUDED.ne,
                ne_tab = EXCLUDED.ne_tab,
                ki_group = EXCLUDED.ki_group,
                kr = EXCLUDED.kr,
                pp_kw = EXCLUDED.pp_kw,
                qp_kvar = EXCLUDED.qp_kvar,
                sp_kva = EXCLUDED.sp_kva,
                ip_a = EXCLUDED.ip_a,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(panel.panel_id.as_uuid())
        .bind(panel.sum_pn_kw)
        .bind(panel.sum_ki_pn_kw)
        .bind(panel.sum_ki_pn_tg_kvar)
        .bind(panel.sum_n_pn2)
        .bind(panel.ne)
        .bind(i32::try_from(panel.ne_tab).unwrap_or(i32::MAX))
        .bind(panel.ki_group)
        .bind(panel.kr)
        .bind(panel.pp_kw)
        .bind(panel.qp_kvar)
        .bind(panel.sp_kva)
        .bind(panel.ip_a)
        .bind(panel.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn replace_circuit_calc(&mut self, calc: &CircuitCalc) -> CalcResult<()> {
        self.dirty = true;
        sqlx::query(
            r#"
            INSERT INTO circuit_calcs (circuit_id, i_calc_a, du_v, du_pct, du_limit_pct,
                                       s_mm2_selected, method, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (circuit_id) DO UPDATE SET
                i_calc_a = EXCLUDED.i_calc_a,
                du_v = EXCLUDED.du_v,
                du_pct = EXCLUDED.du_pct,
                du_limit_pct = EXCLUDED.du_limit_pct,
                s_mm2_selected = EXCLUDED.s_mm2_selected,
                method = EXCLUDED.method,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(calc.circuit_id.as_uuid())
        .bind(calc.i_calc_a)
        .bind(calc.du_v)
        .bind(calc.du_pct)
        .bind(calc.du_limit_pct)
        .bind(calc.s_mm2_selected)
        .bind(calc.method.as_ref())
        .bind(calc.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn assign_phases(&mut self, assignments: &[PhaseAssignment]) -> CalcResult<()> {
        self.dirty = true;
        for assignment in assignments {
            sqlx::query("UPDATE circuits SET phase = $2, phase_source = 'AUTO' WHERE id = $1")
                .bind(assignment.circuit_id.as_uuid())
                .bind(assignment.phase.as_ref())
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn replace_phase_balance(&mut self, balance: &PanelPhaseBalance) -> CalcResult<()> {
        self.dirty = true;
        let warnings_json = if balance.warnings.is_empty() {
            None
        } else {
            Some(
                serde_json::to_value(&balance.warnings)
                    .map_err(|e| CalcError::Store(format!("Serialize warnings: {}", e)))?,
            )
        };
        sqlx::query(
            r#"
            INSERT INTO panel_phase_balance (panel_id, mode, i_l1_a, i_l2_a, i_l3_a, unbalance_pct,
                                             invalid_manual_count, warnings_json, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (panel_id, mode) DO UPDATE SET
                i_l1_a = EXCLUDED.i_l1_a,
                i_l2_a = EXCLUDED.i_l2_a,
                i_l3_a = EXCLUDED.i_l3_a,
                unbalance_pct = EXCLUDED.unbalance_pct,
                invalid_manual_count = EXCLUDED.invalid_manual_count,
                warnings_json = EXCLUDED.warnings_json,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(balance.panel_id.as_uuid())
        .bind(balance.mode.as_ref())
        .bind(balance.totals.l1_a)
        .bind(balance.totals.l2_a)
        .bind(balance.totals.l3_a)
        .bind(balance.unbalance_pct)
        .bind(i32::try_from(balance.invalid_manual_count).unwrap_or(i32::MAX))
        .bind(warnings_json)
        .bind(balance.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn replace_section_calcs(&mut self, panel_id: PanelId, mode: Mode, calcs: &[SectionCalc]) -> CalcResult<()> {
        self.dirty = true;
        sqlx::query("DELETE FROM section_calcs WHERE panel_id = $1 AND mode = $2")
            .bind(panel_id.as_uuid())
            .bind(mode.as_ref())
            .execute(&mut *self.tx)
            .await?;
        for calc in calcs {
            sqlx::query(
                r#"
                INSERT INTO section_calcs (panel_id, bus_section_id, mode, p_kw, q_kvar, s_kva, i_a, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(panel_id.as_uuid())
            .bind(calc.bus_section_id.as_uuid())
            .bind(mode.as_ref())
            .bind(calc.load.p_kw)
            .bind(calc.load.q_kvar)
            .bind(calc.load.s_kva)
            .bind(calc.load.i_a)
            .bind(calc.updated_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> CalcResult<()> {
        let PgTx { mut tx, dirty } = *self;
        if dirty {
            sqlx::query(
                r#"
                INSERT INTO store_revision (id, revision) VALUES (1, 1)
                ON CONFLICT (id) DO UPDATE SET revision = store_revision.revision + 1
                "#,
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CalcResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
