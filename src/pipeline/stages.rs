//! The two production stages and the collaborators they call.
//!
//! Scraping and post generation themselves live in external services. The
//! stages only translate between job payloads and those services, so they can
//! be tested with any [`InsightCollector`] / [`PostWriter`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::HandlerError;
use crate::scheduler::{Job, JobPayload, QueueName, Source};

use super::stage::{StageContext, StageHandler, StageResult};

/// Request timeout for collaborator calls.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Insights stored for one scrape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedInsights {
    /// Ids of the records the collector stored.
    pub insight_ids: Vec<String>,
    /// Simplified records, forwarded as `insight.new` data.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Fetches and stores insights for a project.
#[async_trait]
pub trait InsightCollector: Send + Sync {
    async fn collect(&self, project_id: &str, sources: &[Source])
        -> anyhow::Result<CollectedInsights>;
}

/// Generates and stores posts from a set of insights. Returns the number of
/// posts written.
#[async_trait]
pub trait PostWriter: Send + Sync {
    async fn generate(&self, project_id: &str, insight_ids: &[String]) -> anyhow::Result<u64>;
}

/// Consumes `scrape-project`.
pub struct ScrapeStage {
    collector: Arc<dyn InsightCollector>,
}

impl ScrapeStage {
    pub fn new(collector: Arc<dyn InsightCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl StageHandler for ScrapeStage {
    fn queue(&self) -> QueueName {
        QueueName::ScrapeProject
    }

    async fn handle(&self, job: &Job, _ctx: &mut StageContext) -> Result<StageResult, HandlerError> {
        let JobPayload::ScrapeProject(scrape) = &job.payload else {
            return Err(HandlerError::invalid_payload("expected a scrape-project payload"));
        };
        if scrape.sources.is_empty() {
            return Err(HandlerError::invalid_payload("scrape job has no sources"));
        }

        let collected = self
            .collector
            .collect(&scrape.project_id, &scrape.sources)
            .await?;

        info!(
            job_id = %job.id,
            project_id = %scrape.project_id,
            insights = collected.insight_ids.len(),
            "Scrape complete"
        );

        Ok(StageResult::Scraped {
            project_id: scrape.project_id.clone(),
            insight_ids: collected.insight_ids,
            data: collected.data,
        })
    }
}

/// Consumes `generate-posts`. Terminal stage.
pub struct PostgenStage {
    writer: Arc<dyn PostWriter>,
}

impl PostgenStage {
    pub fn new(writer: Arc<dyn PostWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl StageHandler for PostgenStage {
    fn queue(&self) -> QueueName {
        QueueName::GeneratePosts
    }

    async fn handle(&self, job: &Job, _ctx: &mut StageContext) -> Result<StageResult, HandlerError> {
        let JobPayload::GeneratePosts(postgen) = &job.payload else {
            return Err(HandlerError::invalid_payload("expected a generate-posts payload"));
        };

        let count = self
            .writer
            .generate(&postgen.project_id, &postgen.insight_ids)
            .await?;

        info!(
            job_id = %job.id,
            project_id = %postgen.project_id,
            posts = count,
            "Generated posts"
        );

        Ok(StageResult::PostsGenerated {
            project_id: postgen.project_id.clone(),
            count,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeRequest<'a> {
    project_id: &'a str,
    sources: &'a [Source],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    project_id: &'a str,
    insight_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    posts_count: u64,
}

/// Scraper and post generation services reached over HTTP.
///
/// - `POST {scraper_url}/scrape` → `{"insightIds": [...], "data": [...]}`
/// - `POST {postgen_url}/generate` → `{"postsCount": n}`
pub struct HttpCollaborator {
    /// HTTP client for making service requests.
    client: Client,
    scraper_url: String,
    postgen_url: String,
}

impl HttpCollaborator {
    /// Creates a collaborator for the given service base URLs.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(scraper_url: impl Into<String>, postgen_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            scraper_url: scraper_url.into(),
            postgen_url: postgen_url.into(),
        })
    }

    fn endpoint(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl InsightCollector for HttpCollaborator {
    async fn collect(
        &self,
        project_id: &str,
        sources: &[Source],
    ) -> anyhow::Result<CollectedInsights> {
        let url = Self::endpoint(&self.scraper_url, "scrape");
        let response = self
            .client
            .post(&url)
            .json(&ScrapeRequest {
                project_id,
                sources,
            })
            .send()
            .await
            .with_context(|| format!("POST {}", url))?
            .error_for_status()
            .with_context(|| format!("scraper rejected project {}", project_id))?;

        response
            .json::<CollectedInsights>()
            .await
            .context("Malformed scraper response")
    }
}

#[async_trait]
impl PostWriter for HttpCollaborator {
    async fn generate(&self, project_id: &str, insight_ids: &[String]) -> anyhow::Result<u64> {
        let url = Self::endpoint(&self.postgen_url, "generate");
        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                project_id,
                insight_ids,
            })
            .send()
            .await
            .with_context(|| format!("POST {}", url))?
            .error_for_status()
            .with_context(|| format!("post generator rejected project {}", project_id))?;

        let body: GenerateResponse = response
            .json()
            .await
            .context("Malformed post generator response")?;
        Ok(body.posts_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{GeneratePostsJob, RetryPolicy, ScrapeProjectJob};
    use std::sync::Mutex;

    struct StubCollector {
        calls: Mutex<Vec<(String, Vec<Source>)>>,
    }

    #[async_trait]
    impl InsightCollector for StubCollector {
        async fn collect(
            &self,
            project_id: &str,
            sources: &[Source],
        ) -> anyhow::Result<CollectedInsights> {
            self.calls
                .lock()
                .expect("lock")
                .push((project_id.to_string(), sources.to_vec()));
            Ok(CollectedInsights {
                insight_ids: vec!["i1".into()],
                data: serde_json::json!([{"text": "shipping v2"}]),
            })
        }
    }

    struct FailingWriter;

    #[async_trait]
    impl PostWriter for FailingWriter {
        async fn generate(&self, _project_id: &str, _insight_ids: &[String]) -> anyhow::Result<u64> {
            Err(anyhow::anyhow!("llm quota exhausted")).context("generating posts")
        }
    }

    fn job(payload: JobPayload) -> Job {
        Job::new(payload, &RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_scrape_stage_reports_insights() {
        let collector = Arc::new(StubCollector {
            calls: Mutex::new(Vec::new()),
        });
        let stage = ScrapeStage::new(collector.clone());
        let job = job(ScrapeProjectJob::new("p1", Source::ALL.to_vec()).into());
        let mut ctx = StageContext::new(&job);

        let result = stage.handle(&job, &mut ctx).await.expect("scrape");

        assert_eq!(
            result,
            StageResult::Scraped {
                project_id: "p1".into(),
                insight_ids: vec!["i1".into()],
                data: serde_json::json!([{"text": "shipping v2"}]),
            }
        );
        assert_eq!(
            collector.calls.lock().expect("lock")[0],
            ("p1".to_string(), vec![Source::Twitter, Source::Farcaster])
        );
    }

    #[tokio::test]
    async fn test_scrape_stage_rejects_empty_sources() {
        let stage = ScrapeStage::new(Arc::new(StubCollector {
            calls: Mutex::new(Vec::new()),
        }));
        let job = job(ScrapeProjectJob::new("p1", vec![]).into());
        let mut ctx = StageContext::new(&job);

        let err = stage.handle(&job, &mut ctx).await.expect_err("no sources");
        assert_eq!(err.kind(), crate::error::HandlerErrorKind::InvalidPayload);
    }

    #[tokio::test]
    async fn test_postgen_stage_surfaces_collaborator_error() {
        let stage = PostgenStage::new(Arc::new(FailingWriter));
        let job = job(GeneratePostsJob::new("p1", vec!["i1".into()]).into());
        let mut ctx = StageContext::new(&job);

        let err = stage.handle(&job, &mut ctx).await.expect_err("writer fails");
        assert!(err.message().contains("generating posts"));
        assert!(err.message().contains("llm quota exhausted"));
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            HttpCollaborator::endpoint("http://localhost:4100/", "scrape"),
            "http://localhost:4100/scrape"
        );
        assert_eq!(
            HttpCollaborator::endpoint("http://postgen:4200", "generate"),
            "http://postgen:4200/generate"
        );
    }

    #[test]
    fn test_wire_formats() {
        let body = serde_json::to_value(ScrapeRequest {
            project_id: "p1",
            sources: &[Source::Farcaster],
        })
        .expect("serialize");
        assert_eq!(body, serde_json::json!({"projectId": "p1", "sources": ["farcaster"]}));

        let insights: CollectedInsights =
            serde_json::from_str(r#"{"insightIds": ["a", "b"]}"#).expect("data is optional");
        assert_eq!(insights.insight_ids, vec!["a", "b"]);
        assert!(insights.data.is_null());

        let generated: GenerateResponse =
            serde_json::from_str(r#"{"postsCount": 4}"#).expect("deserialize");
        assert_eq!(generated.posts_count, 4);
    }
}
