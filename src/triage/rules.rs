use crate::config::ThresholdConfig;
use crate::patient::{ConsciousnessLevel, EsiLevel, PatientSnapshot};

/// Ordered ESI decision list. The most severe level with at least one
/// trigger wins; explanatory factors are accumulated on top of it.
#[derive(Debug, Clone)]
pub struct RuleBasedClassifier {
    thresholds: ThresholdConfig,
}

impl RuleBasedClassifier {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        RuleBasedClassifier { thresholds }
    }

    pub fn classify(&self, snapshot: &PatientSnapshot) -> (EsiLevel, f64, Vec<String>) {
        let levels: [(EsiLevel, &str, Vec<&'static str>); 4] = [
            (EsiLevel::Resuscitation, "immediate_life_threat", self.life_threat_triggers(snapshot)),
            (EsiLevel::Emergent, "high_risk_condition", self.high_risk_triggers(snapshot)),
            (EsiLevel::Urgent, "urgent_stable", self.urgent_triggers(snapshot)),
            (EsiLevel::LessUrgent, "less_urgent", self.less_urgent_triggers(snapshot)),
        ];

        let (level, triggers) = levels
            .into_iter()
            .find(|(_, _, triggers)| !triggers.is_empty())
            .map(|(level, tag, triggers)| {
                let mut reasons = vec![tag];
                reasons.extend(triggers);
                (level, reasons)
            })
            .unwrap_or((EsiLevel::NonUrgent, vec!["non_urgent"]));

        let mut reasons: Vec<String> = Vec::new();
        for reason in triggers.into_iter().chain(self.contributing_factors(snapshot)) {
            if !reasons.iter().any(|r| r == reason) {
                reasons.push(reason.to_string());
            }
        }

        (level, self.thresholds.confidence[level.index()], reasons)
    }

    fn life_threat_triggers(&self, s: &PatientSnapshot) -> Vec<&'static str> {
        let t = &self.thresholds;
        let v = &s.vitals;
        let mut triggers = Vec::new();

        if s.consciousness == ConsciousnessLevel::Unresponsive {
            triggers.push("patient_unresponsive");
        }
        if v.bp_systolic < t.critical_bp_systolic_low || v.bp_systolic > t.critical_bp_systolic_high {
            triggers.push("critical_blood_pressure");
        }
        if v.heart_rate > t.critical_heart_rate_high || v.heart_rate < t.critical_heart_rate_low {
            triggers.push("critical_heart_rate");
        }
        if v.o2_saturation < t.critical_o2_saturation_low {
            triggers.push("critical_hypoxia");
        }
        if v.respiratory_rate < t.critical_respiratory_rate_low {
            triggers.push("critical_respiratory_rate");
        }
        triggers
    }

    fn high_risk_triggers(&self, s: &PatientSnapshot) -> Vec<&'static str> {
        let t = &self.thresholds;
        let mut triggers = Vec::new();

        if s.bleeding {
            triggers.push("active_bleeding");
        }
        if t.high_risk_keywords.iter().any(|k| s.complaint_mentions(k)) {
            triggers.push("high_risk_complaint");
        }
        if s.breathing_difficulty {
            triggers.push("respiratory_distress");
        }
        if s.vitals.bp_systolic < t.high_risk_bp_systolic_low {
            triggers.push("hypotension");
        }
        if s.vitals.o2_saturation < t.high_risk_o2_saturation_low {
            triggers.push("low_oxygen_saturation");
        }
        if s.pain_scale >= t.severe_pain {
            triggers.push("severe_pain");
        }
        triggers
    }

    fn urgent_triggers(&self, s: &PatientSnapshot) -> Vec<&'static str> {
        let t = &self.thresholds;
        let mut triggers = Vec::new();

        if s.trauma_indicator {
            triggers.push("trauma_indicator");
        }
        if s.pain_scale >= t.urgent_pain {
            triggers.push("moderate_pain");
        }
        if s.vitals.bp_systolic > t.urgent_bp_systolic_high {
            triggers.push("hypertension");
        }
        if s.vitals.heart_rate > t.urgent_heart_rate_high {
            triggers.push("tachycardia");
        }
        if s.age > t.elderly_age && t.fall_keywords.iter().any(|k| s.complaint_mentions(k)) {
            triggers.push("elderly_fall_or_injury");
        }
        triggers
    }

    fn less_urgent_triggers(&self, s: &PatientSnapshot) -> Vec<&'static str> {
        let t = &self.thresholds;
        let mut triggers = Vec::new();

        if s.pain_scale >= t.minor_pain {
            triggers.push("mild_pain");
        }
        if t.minor_keywords.iter().any(|k| s.complaint_mentions(k)) {
            triggers.push("infection_symptoms");
        }
        triggers
    }

    /// Independent risk factors reported whatever level fired.
    fn contributing_factors(&self, s: &PatientSnapshot) -> Vec<&'static str> {
        let mut factors = Vec::new();

        if s.bleeding {
            factors.push("active_bleeding");
        }
        if s.breathing_difficulty {
            factors.push("respiratory_distress");
        }
        if s.pain_scale >= self.thresholds.reason_pain {
            factors.push("severe_pain");
        }
        if s.consciousness.is_altered() {
            factors.push("altered_consciousness");
        }
        if s.age <= self.thresholds.infant_max_age || s.age >= self.thresholds.elderly_age {
            factors.push("age_risk_factor");
        }
        if s.trauma_indicator {
            factors.push("trauma_indicator");
        }
        factors
    }
}
