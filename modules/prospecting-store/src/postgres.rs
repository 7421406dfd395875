//! Postgres implementation of the repository contract.
//!
//! Row-granular operations only; no multi-row transactions. Dedup lookups
//! go through pre-normalized `company_norm` / `website_norm` columns
//! written at insert time.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::warn;
use uuid::Uuid;

use prospecting_common::{
    DiscoveryQuery, ProjectConfig, Prospect, ProspectStatus, WebsiteStatus,
};
use prospecting_engine::dedup::{normalize_company_name, normalize_website};
use prospecting_engine::repo::{
    AggregateStats, LinkMeta, ProspectFilters, ProspectPage, ProspectRepo, RepoError, RepoResult,
};

#[derive(Clone)]
pub struct PostgresRepo {
    pool: PgPool,
}

impl PostgresRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))
    }

    async fn fetch_one_by(
        &self,
        column: &str,
        value: &str,
    ) -> RepoResult<Option<Prospect>> {
        let sql = format!("SELECT * FROM prospects WHERE {column} = $1 LIMIT 1");
        let row = sqlx::query_as::<_, ProspectRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(ProspectRow::into_prospect).transpose()
    }
}

fn db_err(e: sqlx::Error) -> RepoError {
    RepoError::Database(e.to_string())
}

/// Fields the partial-update path is allowed to touch.
const UPDATABLE_FIELDS: &[&str] = &[
    "industry",
    "address",
    "city",
    "state",
    "website",
    "website_status",
    "contact_email",
    "contact_phone",
    "contact_name",
    "description",
    "services",
    "google_rating",
    "google_review_count",
    "social_profiles",
    "social_metadata",
    "icp_match_score",
    "is_relevant",
    "relevance_reasoning",
    "score_breakdown",
    "status",
];

const JSON_FIELDS: &[&str] = &[
    "services",
    "social_profiles",
    "social_metadata",
    "score_breakdown",
];

/// A row from the prospects table.
#[derive(Debug, sqlx::FromRow)]
struct ProspectRow {
    id: Uuid,
    google_place_id: Option<String>,
    company_name: String,
    industry: Option<String>,
    address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    website: Option<String>,
    website_status: String,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    contact_name: Option<String>,
    description: Option<String>,
    services: serde_json::Value,
    google_rating: Option<f32>,
    google_review_count: Option<i32>,
    most_recent_review_date: Option<DateTime<Utc>>,
    social_profiles: serde_json::Value,
    social_metadata: serde_json::Value,
    icp_match_score: i32,
    is_relevant: bool,
    relevance_reasoning: String,
    score_breakdown: Option<serde_json::Value>,
    run_id: Uuid,
    source: String,
    status: String,
    icp_brief_snapshot: Option<serde_json::Value>,
    prompts_snapshot: Option<serde_json::Value>,
    model_selections_snapshot: Option<serde_json::Value>,
    discovery_cost_usd: f64,
    discovery_time_ms: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProspectRow {
    fn into_prospect(self) -> RepoResult<Prospect> {
        let parse = |e: String| RepoError::Database(e);
        Ok(Prospect {
            id: self.id,
            google_place_id: self.google_place_id,
            company_name: self.company_name,
            industry: self.industry,
            address: self.address,
            city: self.city,
            state: self.state,
            website: self.website,
            website_status: WebsiteStatus::from_str(&self.website_status).map_err(parse)?,
            contact_email: self.contact_email,
            contact_phone: self.contact_phone,
            contact_name: self.contact_name,
            description: self.description,
            services: serde_json::from_value(self.services).unwrap_or_default(),
            google_rating: self.google_rating,
            google_review_count: self.google_review_count.map(|n| n.max(0) as u32),
            most_recent_review_date: self.most_recent_review_date,
            social_profiles: serde_json::from_value(self.social_profiles).unwrap_or_default(),
            social_metadata: serde_json::from_value(self.social_metadata).unwrap_or_default(),
            icp_match_score: self.icp_match_score.max(0) as u32,
            is_relevant: self.is_relevant,
            relevance_reasoning: self.relevance_reasoning,
            score_breakdown: self
                .score_breakdown
                .and_then(|v| serde_json::from_value(v).ok()),
            run_id: self.run_id,
            source: self.source,
            status: ProspectStatus::from_str(&self.status)
                .map_err(|e| RepoError::Database(e))?,
            icp_brief_snapshot: self.icp_brief_snapshot.unwrap_or(serde_json::Value::Null),
            prompts_snapshot: self.prompts_snapshot.unwrap_or(serde_json::Value::Null),
            model_selections_snapshot: self
                .model_selections_snapshot
                .unwrap_or(serde_json::Value::Null),
            discovery_cost_usd: self.discovery_cost_usd,
            discovery_time_ms: self.discovery_time_ms.max(0) as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl ProspectRepo for PostgresRepo {
    async fn find_by_place_id(&self, place_id: &str) -> RepoResult<Option<Prospect>> {
        self.fetch_one_by("google_place_id", place_id).await
    }

    async fn find_by_website_norm(&self, website_norm: &str) -> RepoResult<Option<Prospect>> {
        self.fetch_one_by("website_norm", website_norm).await
    }

    async fn find_by_company_norm(&self, company_norm: &str) -> RepoResult<Option<Prospect>> {
        self.fetch_one_by("company_norm", company_norm).await
    }

    async fn get_prospect(&self, id: Uuid) -> RepoResult<Option<Prospect>> {
        let row = sqlx::query_as::<_, ProspectRow>("SELECT * FROM prospects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(ProspectRow::into_prospect).transpose()
    }

    async fn insert_prospect(&self, p: &Prospect) -> RepoResult<Uuid> {
        let result = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO prospects
                (id, google_place_id, company_name, company_norm, industry,
                 address, city, state, website, website_norm, website_status,
                 contact_email, contact_phone, contact_name, description,
                 services, google_rating, google_review_count,
                 most_recent_review_date, social_profiles, social_metadata,
                 icp_match_score, is_relevant, relevance_reasoning,
                 score_breakdown, run_id, source, status, icp_brief_snapshot,
                 prompts_snapshot, model_selections_snapshot,
                 discovery_cost_usd, discovery_time_ms, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24,
                    $25, $26, $27, $28, $29, $30, $31, $32, $33, $34, $35)
            RETURNING id
            "#,
        )
        .bind(p.id)
        .bind(&p.google_place_id)
        .bind(&p.company_name)
        .bind(normalize_company_name(&p.company_name))
        .bind(&p.industry)
        .bind(&p.address)
        .bind(&p.city)
        .bind(&p.state)
        .bind(&p.website)
        .bind(p.website.as_deref().map(normalize_website))
        .bind(p.website_status.to_string())
        .bind(&p.contact_email)
        .bind(&p.contact_phone)
        .bind(&p.contact_name)
        .bind(&p.description)
        .bind(serde_json::json!(p.services))
        .bind(p.google_rating)
        .bind(p.google_review_count.map(|n| n as i32))
        .bind(p.most_recent_review_date)
        .bind(serde_json::to_value(&p.social_profiles).unwrap_or_default())
        .bind(serde_json::to_value(&p.social_metadata).unwrap_or_default())
        .bind(p.icp_match_score as i32)
        .bind(p.is_relevant)
        .bind(&p.relevance_reasoning)
        .bind(
            p.score_breakdown
                .as_ref()
                .and_then(|b| serde_json::to_value(b).ok()),
        )
        .bind(p.run_id)
        .bind(&p.source)
        .bind(p.status.to_string())
        .bind(&p.icp_brief_snapshot)
        .bind(&p.prompts_snapshot)
        .bind(&p.model_selections_snapshot)
        .bind(p.discovery_cost_usd)
        .bind(p.discovery_time_ms as i64)
        .bind(p.created_at)
        .bind(p.updated_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RepoError::DuplicatePlaceId(
                    p.google_place_id.clone().unwrap_or_default(),
                ))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn update_prospect_fields(
        &self,
        id: Uuid,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> RepoResult<()> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE prospects SET ");
        let mut any = false;

        for (key, value) in fields {
            if !UPDATABLE_FIELDS.contains(&key.as_str()) {
                warn!(field = key.as_str(), "Ignoring non-updatable prospect field");
                continue;
            }
            if any {
                builder.push(", ");
            }
            builder.push(format!("{key} = "));
            if JSON_FIELDS.contains(&key.as_str()) {
                builder.push_bind(value.clone());
            } else {
                match value {
                    serde_json::Value::String(s) => builder.push_bind(s.clone()),
                    serde_json::Value::Bool(b) => builder.push_bind(*b),
                    serde_json::Value::Number(n) if n.is_i64() => {
                        builder.push_bind(n.as_i64().unwrap_or_default() as i32)
                    }
                    serde_json::Value::Number(n) => {
                        builder.push_bind(n.as_f64().unwrap_or_default())
                    }
                    serde_json::Value::Null => builder.push("NULL"),
                    other => builder.push_bind(other.clone()),
                };
            }
            any = true;
        }

        if !any {
            return Ok(());
        }
        builder.push(", updated_at = now() WHERE id = ");
        builder.push_bind(id);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn link_prospect_to_project(
        &self,
        prospect_id: Uuid,
        project_id: Uuid,
        meta: &LinkMeta,
    ) -> RepoResult<()> {
        // Idempotent: the unique (project_id, prospect_id) violation is
        // swallowed and the original link stands.
        sqlx::query(
            r#"
            INSERT INTO project_prospects
                (project_id, prospect_id, run_id, icp_brief_snapshot,
                 prompts_snapshot, model_selections_snapshot,
                 relevance_reasoning, discovery_cost_usd, discovery_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (project_id, prospect_id) DO NOTHING
            "#,
        )
        .bind(project_id)
        .bind(prospect_id)
        .bind(meta.run_id)
        .bind(&meta.icp_brief_snapshot)
        .bind(&meta.prompts_snapshot)
        .bind(&meta.model_selections_snapshot)
        .bind(&meta.relevance_reasoning)
        .bind(meta.discovery_cost_usd)
        .bind(meta.discovery_time_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn exists_in_project(&self, prospect_id: Uuid, project_id: Uuid) -> RepoResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM project_prospects
                WHERE project_id = $1 AND prospect_id = $2
            )
            "#,
        )
        .bind(project_id)
        .bind(prospect_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(exists)
    }

    async fn list_prospects(&self, filters: &ProspectFilters) -> RepoResult<ProspectPage> {
        fn apply_filters(builder: &mut QueryBuilder<Postgres>, filters: &ProspectFilters) {
            if let Some(status) = &filters.status {
                builder.push(" AND status = ").push_bind(status.clone());
            }
            if let Some(city) = &filters.city {
                builder.push(" AND city ILIKE ").push_bind(city.clone());
            }
            if let Some(industry) = &filters.industry {
                builder.push(" AND industry ILIKE ").push_bind(industry.clone());
            }
            if let Some(min_rating) = filters.min_rating {
                builder.push(" AND google_rating >= ").push_bind(min_rating);
            }
            if let Some(run_id) = filters.run_id {
                builder.push(" AND run_id = ").push_bind(run_id);
            }
            if let Some(project_id) = filters.project_id {
                builder
                    .push(" AND id IN (SELECT prospect_id FROM project_prospects WHERE project_id = ")
                    .push_bind(project_id)
                    .push(")");
            }
            if let Some(months) = filters.recently_reviewed_within_months {
                builder
                    .push(" AND most_recent_review_date >= now() - make_interval(months => ")
                    .push_bind(months as i32)
                    .push(")");
            }
        }

        let mut count_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM prospects WHERE TRUE");
        apply_filters(&mut count_builder, filters);
        let total_count = count_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM prospects WHERE TRUE");
        apply_filters(&mut builder, filters);
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filters.limit.clamp(1, 100) as i64)
            .push(" OFFSET ")
            .push_bind(filters.offset as i64);

        let rows = builder
            .build_query_as::<ProspectRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let items = rows
            .into_iter()
            .map(ProspectRow::into_prospect)
            .collect::<RepoResult<Vec<_>>>()?;

        Ok(ProspectPage {
            items,
            total_count: total_count.max(0) as u64,
        })
    }

    async fn aggregate_stats(&self) -> RepoResult<AggregateStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   AVG(google_rating) AS average_rating,
                   COUNT(website) AS with_website,
                   COUNT(*) FILTER (WHERE social_profiles != '{}'::jsonb) AS with_social
            FROM prospects
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stats = AggregateStats {
            total: totals.get::<i64, _>("total").max(0) as u64,
            average_rating: totals.get::<Option<f64>, _>("average_rating"),
            with_website: totals.get::<i64, _>("with_website").max(0) as u64,
            with_social: totals.get::<i64, _>("with_social").max(0) as u64,
            by_status: BTreeMap::new(),
            by_industry: BTreeMap::new(),
        };

        let by_status =
            sqlx::query("SELECT status, COUNT(*) AS n FROM prospects GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        for row in by_status {
            stats
                .by_status
                .insert(row.get("status"), row.get::<i64, _>("n").max(0) as u64);
        }

        let by_industry = sqlx::query(
            "SELECT industry, COUNT(*) AS n FROM prospects WHERE industry IS NOT NULL GROUP BY industry",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for row in by_industry {
            stats
                .by_industry
                .insert(row.get("industry"), row.get::<i64, _>("n").max(0) as u64);
        }

        Ok(stats)
    }

    async fn get_project_config(&self, project_id: Uuid) -> RepoResult<ProjectConfig> {
        let row = sqlx::query(
            r#"
            SELECT icp_brief, prospecting_prompts, prospecting_model_selections
            FROM projects WHERE id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row
            .map(|r| ProjectConfig {
                icp_brief: r.get("icp_brief"),
                prospecting_prompts: r.get("prospecting_prompts"),
                prospecting_model_selections: r.get("prospecting_model_selections"),
            })
            .unwrap_or_default())
    }

    async fn save_project_icp_and_prompts(
        &self,
        project_id: Uuid,
        icp_brief: &serde_json::Value,
        prompts: &serde_json::Value,
    ) -> RepoResult<()> {
        // Write-if-absent: existing non-null values always win.
        sqlx::query(
            r#"
            INSERT INTO projects (id, icp_brief, prospecting_prompts)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                icp_brief = COALESCE(projects.icp_brief, EXCLUDED.icp_brief),
                prospecting_prompts =
                    COALESCE(projects.prospecting_prompts, EXCLUDED.prospecting_prompts)
            "#,
        )
        .bind(project_id)
        .bind(icp_brief)
        .bind(prompts)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn save_prospecting_config(
        &self,
        project_id: Uuid,
        model_selections: &serde_json::Value,
    ) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, prospecting_model_selections)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET
                prospecting_model_selections = COALESCE(
                    projects.prospecting_model_selections,
                    EXCLUDED.prospecting_model_selections
                )
            "#,
        )
        .bind(project_id)
        .bind(model_selections)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn save_discovery_query(&self, q: &DiscoveryQuery) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO discovery_queries
                (project_id, query, search_location, iteration, strategy,
                 total_results, unique_results, new_prospects_added, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(q.project_id)
        .bind(&q.query)
        .bind(&q.search_location)
        .bind(q.iteration as i32)
        .bind(&q.strategy)
        .bind(q.total_results as i32)
        .bind(q.unique_results as i32)
        .bind(q.new_prospects_added as i32)
        .bind(q.executed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_previous_queries(
        &self,
        project_id: Uuid,
        limit: u32,
    ) -> RepoResult<Vec<DiscoveryQuery>> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, query, search_location, iteration, strategy,
                   total_results, unique_results, new_prospects_added, executed_at
            FROM discovery_queries
            WHERE project_id = $1
            ORDER BY executed_at DESC
            LIMIT $2
            "#,
        )
        .bind(project_id)
        .bind(limit.min(500) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| DiscoveryQuery {
                project_id: r.get("project_id"),
                query: r.get("query"),
                search_location: r.get("search_location"),
                iteration: r.get::<i32, _>("iteration").max(0) as u32,
                strategy: r.get("strategy"),
                total_results: r.get::<i32, _>("total_results").max(0) as u32,
                unique_results: r.get::<i32, _>("unique_results").max(0) as u32,
                new_prospects_added: r.get::<i32, _>("new_prospects_added").max(0) as u32,
                executed_at: r.get("executed_at"),
            })
            .collect())
    }

    async fn query_exists(&self, project_id: Uuid, query: &str) -> RepoResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM discovery_queries WHERE project_id = $1 AND query = $2)",
        )
        .bind(project_id)
        .bind(query)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_round_trips_into_prospect() {
        let now = Utc::now();
        let row = ProspectRow {
            id: Uuid::new_v4(),
            google_place_id: Some("place-1".to_string()),
            company_name: "Acme Plumbing".to_string(),
            industry: Some("plumbing".to_string()),
            address: Some("1 Main St".to_string()),
            city: Some("Philadelphia".to_string()),
            state: Some("PA".to_string()),
            website: Some("https://acme.example".to_string()),
            website_status: "active".to_string(),
            contact_email: Some("hi@acme.example".to_string()),
            contact_phone: None,
            contact_name: None,
            description: None,
            services: serde_json::json!(["Drains"]),
            google_rating: Some(4.5),
            google_review_count: Some(100),
            most_recent_review_date: Some(now),
            social_profiles: serde_json::json!({"instagram": "https://instagram.com/acme"}),
            social_metadata: serde_json::json!({}),
            icp_match_score: 82,
            is_relevant: true,
            relevance_reasoning: "ok".to_string(),
            score_breakdown: Some(serde_json::json!({
                "industry_match": 40, "location_match": 20, "quality": 18,
                "online_presence": 2, "data_completeness": 2,
            })),
            run_id: Uuid::new_v4(),
            source: "prospecting-engine".to_string(),
            status: "prospected".to_string(),
            icp_brief_snapshot: None,
            prompts_snapshot: None,
            model_selections_snapshot: None,
            discovery_cost_usd: 0.25,
            discovery_time_ms: 1200,
            created_at: now,
            updated_at: now,
        };

        let prospect = row.into_prospect().unwrap();
        assert_eq!(prospect.website_status, WebsiteStatus::Active);
        assert_eq!(prospect.status, ProspectStatus::Prospected);
        assert_eq!(prospect.icp_match_score, 82);
        assert_eq!(prospect.services, vec!["Drains".to_string()]);
        assert_eq!(prospect.social_profiles.len(), 1);
        assert_eq!(prospect.score_breakdown.unwrap().total(), 82);
    }

    #[test]
    fn bad_status_string_is_a_database_error() {
        let now = Utc::now();
        let row = ProspectRow {
            id: Uuid::new_v4(),
            google_place_id: None,
            company_name: "X".to_string(),
            industry: None,
            address: None,
            city: None,
            state: None,
            website: None,
            website_status: "weird".to_string(),
            contact_email: None,
            contact_phone: None,
            contact_name: None,
            description: None,
            services: serde_json::json!([]),
            google_rating: None,
            google_review_count: None,
            most_recent_review_date: None,
            social_profiles: serde_json::json!({}),
            social_metadata: serde_json::json!({}),
            icp_match_score: 0,
            is_relevant: false,
            relevance_reasoning: String::new(),
            score_breakdown: None,
            run_id: Uuid::new_v4(),
            source: "prospecting-engine".to_string(),
            status: "prospected".to_string(),
            icp_brief_snapshot: None,
            prompts_snapshot: None,
            model_selections_snapshot: None,
            discovery_cost_usd: 0.0,
            discovery_time_ms: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(row.into_prospect(), Err(RepoError::Database(_))));
    }
}
