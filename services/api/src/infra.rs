use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use wil_engine::workflows::placements::{
    DomainEvent, EmitError, EventSink, LearnerId, PlacementId, Verdict, VerificationError,
    VerificationFactors, VerificationGateway,
};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Checks check-in proof against the site pass policy: a QR pass must have
/// been issued for the placement being entered and still be valid, and a
/// device PIN must match the hash configured for the deployment.
pub(crate) struct SitePassVerifier {
    expected_pin_hash: Option<String>,
}

impl SitePassVerifier {
    pub(crate) fn new(expected_pin_hash: Option<String>) -> Self {
        Self { expected_pin_hash }
    }

    /// Reads `WIL_DEVICE_PIN_HASH`; when unset, PIN check-ins are rejected.
    pub(crate) fn from_env() -> Self {
        Self::new(std::env::var("WIL_DEVICE_PIN_HASH").ok())
    }
}

#[async_trait::async_trait]
impl VerificationGateway for SitePassVerifier {
    async fn verify(
        &self,
        _learner_id: &LearnerId,
        placement_id: &PlacementId,
        factors: &VerificationFactors,
    ) -> Result<Verdict, VerificationError> {
        if let Some(qr) = &factors.qr_payload {
            if &qr.issued_for != placement_id {
                return Ok(Verdict::Rejected {
                    reason: "qr pass was issued for a different placement".to_string(),
                });
            }
            if qr.expires_at <= Utc::now() {
                return Ok(Verdict::Rejected {
                    reason: "qr pass has expired".to_string(),
                });
            }
            return Ok(Verdict::Accepted {
                evidence_ref: format!("qr:{}", qr.token),
            });
        }

        if let Some(pin_hash) = &factors.device_pin_hash {
            return match &self.expected_pin_hash {
                Some(expected) if expected == pin_hash => {
                    let prefix: String = pin_hash.chars().take(8).collect();
                    Ok(Verdict::Accepted {
                        evidence_ref: format!("pin:{prefix}"),
                    })
                }
                Some(_) => Ok(Verdict::Rejected {
                    reason: "device pin does not match the site pin".to_string(),
                }),
                None => Ok(Verdict::Rejected {
                    reason: "no site pin is configured for this deployment".to_string(),
                }),
            };
        }

        Ok(Verdict::Rejected {
            reason: "no usable verification factor was submitted".to_string(),
        })
    }
}

/// Writes each committed domain event to the service log as JSON.
pub(crate) struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) -> Result<(), EmitError> {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                tracing::info!(event = event.kind(), %payload, "domain event");
                Ok(())
            }
            Err(err) => Err(EmitError::Transport(err.to_string())),
        }
    }
}

/// Keeps every emitted event so a demo run can replay them at the end.
#[derive(Default)]
pub(crate) struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub(crate) fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().expect("event mutex poisoned").clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: DomainEvent) -> Result<(), EmitError> {
        self.events
            .lock()
            .expect("event mutex poisoned")
            .push(event);
        Ok(())
    }
}

pub(crate) fn parse_month(raw: &str) -> Result<(i32, u32), String> {
    let trimmed = raw.trim();
    let (year, month) = trimmed
        .split_once('-')
        .ok_or_else(|| format!("failed to parse '{raw}' as YYYY-MM"))?;
    let year: i32 = year
        .parse()
        .map_err(|_| format!("failed to parse '{raw}' as YYYY-MM"))?;
    let month: u32 = month
        .parse()
        .map_err(|_| format!("failed to parse '{raw}' as YYYY-MM"))?;
    if !(1..=12).contains(&month) {
        return Err(format!("month in '{raw}' must be between 01 and 12"));
    }
    Ok((year, month))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wil_engine::workflows::placements::QrPayload;

    fn placement() -> PlacementId {
        PlacementId("pl-clinic".to_string())
    }

    fn learner() -> LearnerId {
        LearnerId("lrn-amina".to_string())
    }

    fn no_factors() -> VerificationFactors {
        VerificationFactors {
            device_pin_hash: None,
            qr_payload: None,
            geolocation: None,
            selfie_ref: None,
        }
    }

    fn qr_factors(issued_for: &str, expires_in: Duration) -> VerificationFactors {
        VerificationFactors {
            qr_payload: Some(QrPayload {
                token: "tok-123".to_string(),
                issued_for: PlacementId(issued_for.to_string()),
                expires_at: Utc::now() + expires_in,
            }),
            ..no_factors()
        }
    }

    #[tokio::test]
    async fn qr_pass_for_the_right_placement_is_accepted() {
        let verifier = SitePassVerifier::new(None);
        let verdict = verifier
            .verify(&learner(), &placement(), &qr_factors("pl-clinic", Duration::hours(1)))
            .await
            .expect("gateway call succeeds");
        assert_eq!(
            verdict,
            Verdict::Accepted {
                evidence_ref: "qr:tok-123".to_string()
            }
        );
    }

    #[tokio::test]
    async fn qr_pass_for_another_placement_is_rejected() {
        let verifier = SitePassVerifier::new(None);
        let verdict = verifier
            .verify(&learner(), &placement(), &qr_factors("pl-depot", Duration::hours(1)))
            .await
            .expect("gateway call succeeds");
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("different placement")));
    }

    #[tokio::test]
    async fn expired_qr_pass_is_rejected() {
        let verifier = SitePassVerifier::new(None);
        let verdict = verifier
            .verify(&learner(), &placement(), &qr_factors("pl-clinic", Duration::hours(-1)))
            .await
            .expect("gateway call succeeds");
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("expired")));
    }

    #[tokio::test]
    async fn matching_device_pin_is_accepted() {
        let verifier = SitePassVerifier::new(Some("sha256:abcdef".to_string()));
        let factors = VerificationFactors {
            device_pin_hash: Some("sha256:abcdef".to_string()),
            ..no_factors()
        };
        let verdict = verifier
            .verify(&learner(), &placement(), &factors)
            .await
            .expect("gateway call succeeds");
        assert!(matches!(verdict, Verdict::Accepted { evidence_ref } if evidence_ref.starts_with("pin:")));
    }

    #[tokio::test]
    async fn wrong_device_pin_is_rejected() {
        let verifier = SitePassVerifier::new(Some("sha256:abcdef".to_string()));
        let factors = VerificationFactors {
            device_pin_hash: Some("sha256:other".to_string()),
            ..no_factors()
        };
        let verdict = verifier
            .verify(&learner(), &placement(), &factors)
            .await
            .expect("gateway call succeeds");
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("does not match")));
    }

    #[tokio::test]
    async fn empty_factor_bundle_is_rejected() {
        let verifier = SitePassVerifier::new(Some("sha256:abcdef".to_string()));
        let verdict = verifier
            .verify(&learner(), &placement(), &no_factors())
            .await
            .expect("gateway call succeeds");
        assert!(matches!(verdict, Verdict::Rejected { reason } if reason.contains("no usable")));
    }

    #[test]
    fn parse_month_accepts_padded_and_unpadded() {
        assert_eq!(parse_month("2026-03"), Ok((2026, 3)));
        assert_eq!(parse_month(" 2026-11 "), Ok((2026, 11)));
    }

    #[test]
    fn parse_month_rejects_garbage() {
        assert!(parse_month("march").is_err());
        assert!(parse_month("2026-13").is_err());
        assert!(parse_month("2026-00").is_err());
    }
}
