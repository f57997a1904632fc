//! Quality gate handler.

use crate::bus::Delivery;
use crate::models::QualityGateRequest;

use super::subjects::SUBJECT_QG_RESULT;
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_quality_gate(&self, delivery: Delivery) -> Result<(), String> {
        let request: QualityGateRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(run_id = %request.run_id, "received quality gate request");

        let result = self.gate_executor.execute(&request).await;
        self.publish_json(SUBJECT_QG_RESULT, &result).await?;

        tracing::info!(
            run_id = %request.run_id,
            tests_passed = ?result.tests_passed,
            lint_passed = ?result.lint_passed,
            "quality gate completed"
        );
        Ok(())
    }
}
