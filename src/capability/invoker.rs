//! 能力调用器
//!
//! invoke(capability_id, input, context, cancel) 经熔断器准入后在超时内调用推理服务，
//! 把一切失败（超时 / 服务错误 / 回答格式不符 / 熔断 / 取消）转为 success = false 的 DecisionResult；
//! 每次调用输出结构化审计日志（JSON），并把结果回写到熔断器。取消不计入熔断器失败。

use std::sync::Arc;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::capability::{
    Admission, BreakerBank, CapabilityRegistry, DecisionResult, InvocationError, Payload,
};
use crate::llm::{ReasoningService, ServiceRequest};
use crate::memory::ContextBundle;
use crate::observability::{CouncilEvent, EventSink};

pub struct CapabilityInvoker {
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerBank>,
    service: Arc<dyn ReasoningService>,
    sink: EventSink,
}

impl CapabilityInvoker {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        breakers: Arc<BreakerBank>,
        service: Arc<dyn ReasoningService>,
        sink: EventSink,
    ) -> Self {
        Self {
            registry,
            breakers,
            service,
            sink,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerBank> {
        &self.breakers
    }

    pub async fn invoke(
        &self,
        capability_id: &str,
        input: &str,
        context: &ContextBundle,
        cancel: CancellationToken,
    ) -> DecisionResult {
        let Some(descriptor) = self.registry.get(capability_id) else {
            return self.reject(capability_id, input, InvocationError::UnknownCapability);
        };
        if !descriptor.enabled {
            return self.reject(capability_id, input, InvocationError::Disabled);
        }
        if cancel.is_cancelled() {
            return DecisionResult::failed(capability_id, input, InvocationError::Cancelled, 0);
        }

        let admitted_at = Instant::now();
        if let Admission::Rejected { retry_in } = self.breakers.admit(capability_id, admitted_at) {
            return self.reject(
                capability_id,
                input,
                InvocationError::Unavailable {
                    retry_in_ms: retry_in.as_millis() as u64,
                },
            );
        }

        self.sink.emit(CouncilEvent::CallStarted {
            capability: capability_id.to_string(),
        });
        let request = ServiceRequest {
            capability_id: capability_id.to_string(),
            system_context: context.to_system_context(),
            user_input: input.to_string(),
        };
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InvocationError::Cancelled),
            r = timeout(descriptor.timeout(), self.service.call(&request)) => match r {
                Ok(Ok(reply)) => match Payload::decode(descriptor.role, reply.answer) {
                    Ok(payload) => Ok((payload, reply.confidence)),
                    Err(e) => Err(InvocationError::MalformedAnswer { message: e.to_string() }),
                },
                Ok(Err(e)) => Err(InvocationError::Service { message: e.to_string() }),
                Err(_) => Err(InvocationError::Timeout { after_ms: descriptor.timeout_ms }),
            },
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let (ok, label) = match &outcome {
            Ok(_) => (true, "ok"),
            Err(e) => (false, e.label()),
        };
        let audit = serde_json::json!({
            "event": "capability_audit",
            "capability": capability_id,
            "ok": ok,
            "outcome": label,
            "duration_ms": latency_ms,
        });
        tracing::info!(audit = %audit.to_string(), "capability");

        match outcome {
            Ok((payload, confidence)) => {
                let result =
                    DecisionResult::succeeded(capability_id, input, payload, confidence, latency_ms);
                self.breakers
                    .record_success(capability_id, latency_ms, result.confidence);
                self.sink.emit(CouncilEvent::CallSucceeded {
                    capability: capability_id.to_string(),
                    confidence: result.confidence,
                    latency_ms,
                });
                result
            }
            Err(InvocationError::Cancelled) => {
                DecisionResult::failed(capability_id, input, InvocationError::Cancelled, latency_ms)
            }
            Err(error) => {
                self.breakers
                    .record_failure(capability_id, Instant::now(), latency_ms);
                self.sink.emit(CouncilEvent::CallFailed {
                    capability: capability_id.to_string(),
                    reason: error.to_string(),
                    latency_ms,
                });
                DecisionResult::failed(capability_id, input, error, latency_ms)
            }
        }
    }

    fn reject(&self, capability_id: &str, input: &str, error: InvocationError) -> DecisionResult {
        tracing::debug!(capability = %capability_id, reason = %error, "Call rejected");
        self.sink.emit(CouncilEvent::CallRejected {
            capability: capability_id.to_string(),
            reason: error.to_string(),
        });
        DecisionResult::failed(capability_id, input, error, 0)
    }
}
