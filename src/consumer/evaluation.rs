//! Collaboration evaluation handler.

use crate::bus::Delivery;
use crate::evaluation::evaluate_collaboration;
use crate::models::GemmasEvalRequest;

use super::subjects::SUBJECT_EVAL_GEMMAS_RESULT;
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_gemmas_eval(&self, delivery: Delivery) -> Result<(), String> {
        let request: GemmasEvalRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            plan_id = %request.plan_id,
            messages = request.messages.len(),
            "received collaboration evaluation request"
        );

        let result =
            evaluate_collaboration(request.messages, &request.plan_id, Some(self.llm.clone())).await;
        self.publish_json(SUBJECT_EVAL_GEMMAS_RESULT, &result).await?;

        tracing::info!(
            plan_id = %request.plan_id,
            ids = result.information_diversity_score,
            upr = result.unnecessary_path_ratio,
            "collaboration evaluation completed"
        );
        Ok(())
    }
}
