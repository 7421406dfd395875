//! Cross-run deduplication.
//!
//! Three-tier existence check for a candidate identity: outreach records
//! win over analysis records (leads) win over plain prospects. Within a
//! tier, matching priority is exact place_id, then normalized website,
//! then normalized company name. The service only inspects; it never
//! creates or mutates records.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use prospecting_common::{Prospect, ProspectStatus};

use crate::repo::{CompanyIdentity, ProspectRepo, RepoResult};

/// Corporate suffixes stripped during company-name normalization.
const CORPORATE_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "ltd", "limited", "corp", "corporation", "co", "company",
    "gmbh", "sa", "plc", "pllc", "llp", "pc",
];

/// What the orchestrator should do with a candidate.
#[derive(Debug, Clone)]
pub enum DedupDecision {
    /// An outreach record references this identity. Do not enrich, do not
    /// link; the record is immutable to the pipeline.
    SkipContacted,
    /// An analysis record (lead) references this identity.
    UseExistingLead(Uuid),
    /// A prospect exists globally and is already linked (or no project is
    /// in scope).
    UseExistingProspect(Box<Prospect>),
    /// A prospect exists globally but is not yet linked to this project.
    LinkOnly(Box<Prospect>),
    /// Nothing matches; run the full pipeline.
    NewWork,
}

pub struct DedupService {
    repo: Arc<dyn ProspectRepo>,
}

impl DedupService {
    pub fn new(repo: Arc<dyn ProspectRepo>) -> Self {
        Self { repo }
    }

    /// Resolve a candidate identity against the store.
    pub async fn check(
        &self,
        identity: &CompanyIdentity,
        project_id: Option<Uuid>,
    ) -> RepoResult<DedupDecision> {
        let Some(existing) = self.best_match(identity).await? else {
            return Ok(DedupDecision::NewWork);
        };

        debug!(
            company = identity.company_name,
            existing_id = %existing.id,
            status = %existing.status,
            "Dedup matched an existing record"
        );

        match existing.status {
            ProspectStatus::Contacted => Ok(DedupDecision::SkipContacted),
            ProspectStatus::Analyzed => Ok(DedupDecision::UseExistingLead(existing.id)),
            ProspectStatus::Prospected => {
                if let Some(project_id) = project_id {
                    if !self.repo.exists_in_project(existing.id, project_id).await? {
                        return Ok(DedupDecision::LinkOnly(Box::new(existing)));
                    }
                }
                Ok(DedupDecision::UseExistingProspect(Box::new(existing)))
            }
        }
    }

    /// Matching priority: place_id > normalized website > normalized name.
    async fn best_match(&self, identity: &CompanyIdentity) -> RepoResult<Option<Prospect>> {
        if let Some(place_id) = identity.google_place_id.as_deref() {
            if let Some(found) = self.repo.find_by_place_id(place_id).await? {
                return Ok(Some(found));
            }
        }
        if let Some(website) = identity.website.as_deref() {
            let norm = normalize_website(website);
            if !norm.is_empty() {
                if let Some(found) = self.repo.find_by_website_norm(&norm).await? {
                    return Ok(Some(found));
                }
            }
        }
        let name_norm = normalize_company_name(&identity.company_name);
        if !name_norm.is_empty() {
            if let Some(found) = self.repo.find_by_company_norm(&name_norm).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

/// Strip scheme, `www.`, query/fragment, and trailing slash; lowercase.
pub fn normalize_website(website: &str) -> String {
    let mut s = website.trim().to_lowercase();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    if let Some(rest) = s.strip_prefix("www.") {
        s = rest.to_string();
    }
    if let Some(idx) = s.find(['?', '#']) {
        s.truncate(idx);
    }
    s.trim_end_matches('/').to_string()
}

/// Lowercase, strip punctuation, collapse whitespace, and drop trailing
/// corporate suffixes.
pub fn normalize_company_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    while let Some(last) = words.last() {
        if CORPORATE_SUFFIXES.contains(last) && words.len() > 1 {
            words.pop();
        } else {
            break;
        }
    }
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRepo;
    use prospecting_common::WebsiteStatus;

    fn prospect(name: &str, website: Option<&str>, place_id: Option<&str>) -> Prospect {
        let mut p = Prospect::new(name, Uuid::new_v4());
        p.website = website.map(String::from);
        p.google_place_id = place_id.map(String::from);
        p.website_status = WebsiteStatus::Active;
        p
    }

    fn identity(name: &str, website: Option<&str>, place_id: Option<&str>) -> CompanyIdentity {
        CompanyIdentity {
            company_name: name.to_string(),
            website: website.map(String::from),
            google_place_id: place_id.map(String::from),
        }
    }

    // --- normalize_website ---

    #[test]
    fn website_normalization_strips_scheme_www_and_slash() {
        assert_eq!(normalize_website("https://www.Acme.com/"), "acme.com");
        assert_eq!(normalize_website("http://acme.com"), "acme.com");
        assert_eq!(normalize_website("acme.com/services/"), "acme.com/services");
    }

    #[test]
    fn website_normalization_strips_query_and_fragment() {
        assert_eq!(
            normalize_website("https://acme.com/?utm_source=maps"),
            "acme.com"
        );
        assert_eq!(normalize_website("https://acme.com/#contact"), "acme.com");
    }

    // --- normalize_company_name ---

    #[test]
    fn company_normalization_strips_punctuation_and_suffixes() {
        assert_eq!(normalize_company_name("Acme Plumbing, LLC"), "acme plumbing");
        assert_eq!(normalize_company_name("Acme Plumbing Inc."), "acme plumbing");
        assert_eq!(normalize_company_name("ACME  PLUMBING"), "acme plumbing");
    }

    #[test]
    fn company_normalization_strips_stacked_suffixes() {
        assert_eq!(normalize_company_name("Acme Co. Ltd."), "acme");
    }

    #[test]
    fn company_normalization_keeps_suffix_only_names() {
        // A company literally named "Company" should not normalize to nothing.
        assert_eq!(normalize_company_name("Company"), "company");
    }

    // --- decision tiers ---

    #[tokio::test]
    async fn no_match_is_new_work() {
        let repo = Arc::new(InMemoryRepo::new());
        let svc = DedupService::new(repo);
        let decision = svc
            .check(&identity("Fresh Co", None, Some("place-x")), None)
            .await
            .unwrap();
        assert!(matches!(decision, DedupDecision::NewWork));
    }

    #[tokio::test]
    async fn contacted_record_skips() {
        let repo = Arc::new(InMemoryRepo::new());
        let mut p = prospect("Acme Plumbing", None, Some("place-1"));
        p.status = ProspectStatus::Contacted;
        repo.seed(p);

        let svc = DedupService::new(repo);
        let decision = svc
            .check(&identity("Acme Plumbing", None, Some("place-1")), None)
            .await
            .unwrap();
        assert!(matches!(decision, DedupDecision::SkipContacted));
    }

    #[tokio::test]
    async fn analyzed_record_is_existing_lead() {
        let repo = Arc::new(InMemoryRepo::new());
        let mut p = prospect("Acme Plumbing", None, Some("place-1"));
        p.status = ProspectStatus::Analyzed;
        let lead_id = p.id;
        repo.seed(p);

        let svc = DedupService::new(repo);
        let decision = svc
            .check(&identity("Acme Plumbing", None, Some("place-1")), None)
            .await
            .unwrap();
        match decision {
            DedupDecision::UseExistingLead(id) => assert_eq!(id, lead_id),
            other => panic!("expected UseExistingLead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unlinked_prospect_in_project_scope_is_link_only() {
        let repo = Arc::new(InMemoryRepo::new());
        let p = prospect("Acme Plumbing", None, Some("place-1"));
        let existing_id = p.id;
        repo.seed(p);

        let svc = DedupService::new(repo);
        let decision = svc
            .check(
                &identity("Acme Plumbing", None, Some("place-1")),
                Some(Uuid::new_v4()),
            )
            .await
            .unwrap();
        match decision {
            DedupDecision::LinkOnly(found) => assert_eq!(found.id, existing_id),
            other => panic!("expected LinkOnly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn linked_prospect_is_use_existing() {
        let repo = Arc::new(InMemoryRepo::new());
        let p = prospect("Acme Plumbing", None, Some("place-1"));
        let existing_id = p.id;
        let project_id = Uuid::new_v4();
        repo.seed(p);
        repo.seed_link(existing_id, project_id);

        let svc = DedupService::new(repo);
        let decision = svc
            .check(
                &identity("Acme Plumbing", None, Some("place-1")),
                Some(project_id),
            )
            .await
            .unwrap();
        assert!(matches!(decision, DedupDecision::UseExistingProspect(_)));
    }

    #[tokio::test]
    async fn no_project_scope_is_use_existing() {
        let repo = Arc::new(InMemoryRepo::new());
        repo.seed(prospect("Acme Plumbing", None, Some("place-1")));

        let svc = DedupService::new(repo);
        let decision = svc
            .check(&identity("Acme Plumbing", None, Some("place-1")), None)
            .await
            .unwrap();
        assert!(matches!(decision, DedupDecision::UseExistingProspect(_)));
    }

    // --- matching priority ---

    #[tokio::test]
    async fn place_id_match_beats_website_match() {
        let repo = Arc::new(InMemoryRepo::new());
        let by_place = prospect("Acme One", None, Some("place-1"));
        let by_place_id = by_place.id;
        repo.seed(by_place);
        repo.seed(prospect("Acme Two", Some("https://acme.com"), Some("place-2")));

        let svc = DedupService::new(repo);
        let decision = svc
            .check(
                &identity("Acme", Some("https://acme.com"), Some("place-1")),
                None,
            )
            .await
            .unwrap();
        match decision {
            DedupDecision::UseExistingProspect(found) => assert_eq!(found.id, by_place_id),
            other => panic!("expected UseExistingProspect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn website_match_beats_name_match() {
        let repo = Arc::new(InMemoryRepo::new());
        let by_site = prospect("Different Name", Some("https://www.acme.com/"), None);
        let by_site_id = by_site.id;
        repo.seed(by_site);
        repo.seed(prospect("Acme Plumbing LLC", None, None));

        let svc = DedupService::new(repo);
        let decision = svc
            .check(
                &identity("Acme Plumbing", Some("http://acme.com"), None),
                None,
            )
            .await
            .unwrap();
        match decision {
            DedupDecision::UseExistingProspect(found) => assert_eq!(found.id, by_site_id),
            other => panic!("expected UseExistingProspect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn normalized_name_matches_across_suffixes() {
        let repo = Arc::new(InMemoryRepo::new());
        repo.seed(prospect("Acme Plumbing, Inc.", None, None));

        let svc = DedupService::new(repo);
        let decision = svc
            .check(&identity("acme plumbing llc", None, None), None)
            .await
            .unwrap();
        assert!(matches!(decision, DedupDecision::UseExistingProspect(_)));
    }
}
