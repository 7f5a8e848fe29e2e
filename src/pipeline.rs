//! Question and chart pipelines: classify → generate → execute → summarise.
//!
//! Each request works on the namespace snapshot it obtained when resolving
//! its session, so a concurrent upload never changes the tables under a
//! running fragment. A request either completes every stage and appends one
//! conversation turn, or fails and leaves the conversation log untouched.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::oracle::{fallback_reply, CodeOracle, Intent};
use crate::sandbox::{ResultShape, Sandbox};
use crate::session::{SessionManager, SessionView};

/// Answer to a question.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub session_id: String,
    pub answer: String,
    pub intent: Intent,
    /// Normalised fragment result for data questions, the figure for chart
    /// requests, absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A rendered chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartAnswer {
    pub session_id: String,
    pub chart_type: String,
    pub chart_data: Value,
    pub description: String,
}

pub struct Assistant {
    manager: Arc<SessionManager>,
    oracle: Arc<dyn CodeOracle>,
    sandbox: Sandbox,
}

/// Schema map handed to the oracle: every table's summary plus whether its
/// raw data is loaded.
pub fn oracle_context(namespace: &Namespace) -> Value {
    let mut schemas = namespace.schemas_json();
    if let Some(map) = schemas.as_object_mut() {
        for entry in namespace.entries() {
            if let Some(Value::Object(schema)) = map.get_mut(&entry.key) {
                schema.insert("has_data".to_string(), Value::Bool(entry.data.is_some()));
            }
        }
    }
    schemas
}

fn chart_description(request: &str) -> String {
    format!("Visualization showing: {}", request)
}

impl Assistant {
    pub fn new(manager: Arc<SessionManager>, oracle: Arc<dyn CodeOracle>) -> Self {
        let sandbox = Sandbox::new(&manager.config().sandbox);
        Self {
            manager,
            oracle,
            sandbox,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Resolve the session and require at least one table with raw data.
    async fn session_with_data(&self, session_id: Option<&str>) -> Result<SessionView> {
        let view = self.manager.get_or_create_session(session_id).await?;
        if !view.namespace.has_data() {
            tracing::info!(session_id = %view.session_id(), "Rejected request on a session without data");
            return Err(Error::NoDataUploaded);
        }
        Ok(view)
    }

    /// Answer a natural-language question about the session's tables.
    pub async fn ask(&self, session_id: Option<&str>, question: &str) -> Result<QueryAnswer> {
        let view = self.session_with_data(session_id).await?;
        let session_id = view.session_id().to_string();
        let schemas = oracle_context(&view.namespace);

        let intent = match self.oracle.classify(question, &schemas).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Classification failed, treating as a data question");
                Intent::DataAnalysis
            }
        };
        tracing::info!(session_id = %session_id, intent = intent.label(), "Classified question");

        let (answer, code, data) = match intent {
            Intent::DataAnalysis => {
                let code = self.oracle.generate_analysis_code(question, &schemas).await?;
                tracing::debug!(session_id = %session_id, code = %code, "Generated analysis fragment");
                let result = self.execute_analysis(&session_id, &code, &view.namespace).await?;
                let answer = self.oracle.summarize_result(question, &result).await?;
                (answer, Some(code), Some(result.to_json()))
            }
            Intent::ChartRequest => {
                let (chart, code) = self.chart(&view, &schemas, question).await?;
                (chart.description, Some(code), Some(chart.chart_data))
            }
            Intent::Greeting | Intent::Conversation | Intent::OutOfScope => {
                let answer = match self.oracle.respond(intent, question).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Reply generation failed, using fallback");
                        fallback_reply(intent, question)
                    }
                };
                (answer, None, None)
            }
        };

        self.manager
            .append_conversation(&session_id, Some(question), Some(&answer), code.as_deref())
            .await?;

        Ok(QueryAnswer {
            session_id,
            answer,
            intent,
            data,
        })
    }

    /// Build a chart for a natural-language request.
    pub async fn visualize(&self, session_id: Option<&str>, request: &str) -> Result<ChartAnswer> {
        let view = self.session_with_data(session_id).await?;
        let schemas = oracle_context(&view.namespace);
        let (chart, code) = self.chart(&view, &schemas, request).await?;

        self.manager
            .append_conversation(
                view.session_id(),
                Some(request),
                Some(&chart.description),
                Some(&code),
            )
            .await?;
        Ok(chart)
    }

    async fn chart(&self, view: &SessionView, schemas: &Value, request: &str) -> Result<(ChartAnswer, String)> {
        let session_id = view.session_id();
        let code = self.oracle.generate_chart_code(request, schemas).await?;
        tracing::debug!(session_id = %session_id, code = %code, "Generated chart fragment");

        let output = self
            .sandbox
            .run_chart(&code, view.namespace.clone())
            .await
            .inspect_err(|e| {
                tracing::warn!(session_id = %session_id, error = %e, code = %code, "Chart fragment failed");
            })?;
        tracing::info!(session_id = %session_id, chart_type = %output.chart_type, "Rendered chart");

        Ok((
            ChartAnswer {
                session_id: session_id.to_string(),
                chart_type: output.chart_type,
                chart_data: output.figure,
                description: chart_description(request),
            },
            code,
        ))
    }

    async fn execute_analysis(&self, session_id: &str, code: &str, namespace: &Arc<Namespace>) -> Result<ResultShape> {
        let result = self
            .sandbox
            .run_analysis(code, namespace.clone())
            .await
            .inspect_err(|e| {
                tracing::warn!(session_id = %session_id, error = %e, code = %code, "Analysis fragment failed");
            })?;
        tracing::info!(session_id = %session_id, shape = result.kind(), "Fragment produced a result");
        Ok(result)
    }

    /// Run a hand-written fragment against an existing session, bypassing
    /// the oracle. Nothing is recorded in the conversation log.
    pub async fn run_fragment(&self, session_id: &str, code: &str, chart: bool) -> Result<Value> {
        let view = self.manager.get_session(session_id).await?;
        if chart {
            let output = self.sandbox.run_chart(code, view.namespace).await?;
            Ok(serde_json::to_value(output)?)
        } else {
            let shape = self.sandbox.run_analysis(code, view.namespace).await?;
            Ok(serde_json::to_value(shape)?)
        }
    }
}
