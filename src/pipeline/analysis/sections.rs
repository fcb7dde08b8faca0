//! Fixed section layouts for the full report and the single-document review.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The ten report sections, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportSection {
    PatientInfo,
    ExaminationFindings,
    RiskStratification,
    KeyCalculations,
    IndividualizedDietPlan,
    ExercisePhysiotherapyPlan,
    ManagementAdviceTriggers,
    RedFlagsEmergencyReturn,
    FollowUpPlan,
    IntegratedReportSummary,
}

impl ReportSection {
    pub const ALL: [ReportSection; 10] = [
        Self::PatientInfo,
        Self::ExaminationFindings,
        Self::RiskStratification,
        Self::KeyCalculations,
        Self::IndividualizedDietPlan,
        Self::ExercisePhysiotherapyPlan,
        Self::ManagementAdviceTriggers,
        Self::RedFlagsEmergencyReturn,
        Self::FollowUpPlan,
        Self::IntegratedReportSummary,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::PatientInfo => "patient_info",
            Self::ExaminationFindings => "examination_findings",
            Self::RiskStratification => "risk_stratification",
            Self::KeyCalculations => "key_calculations",
            Self::IndividualizedDietPlan => "individualized_diet_plan",
            Self::ExercisePhysiotherapyPlan => "exercise_physiotherapy_plan",
            Self::ManagementAdviceTriggers => "management_advice_triggers",
            Self::RedFlagsEmergencyReturn => "red_flags_emergency_return",
            Self::FollowUpPlan => "follow_up_plan",
            Self::IntegratedReportSummary => "integrated_report_summary",
        }
    }

    /// One-line brief used in the synthesis prompt.
    pub fn brief(&self) -> &'static str {
        match self {
            Self::PatientInfo => {
                "demographics, identifiers, presenting complaint and relevant history"
            }
            Self::ExaminationFindings => {
                "vital signs, physical examination and laboratory or imaging results \
                 with values and units"
            }
            Self::RiskStratification => {
                "cardiovascular, metabolic and renal risk categories with the evidence for each"
            }
            Self::KeyCalculations => {
                "derived values such as BMI, eGFR, MAP or risk scores, showing inputs and results"
            }
            Self::IndividualizedDietPlan => {
                "dietary targets and concrete meal guidance fitted to the findings"
            }
            Self::ExercisePhysiotherapyPlan => {
                "activity type, intensity, frequency and precautions"
            }
            Self::ManagementAdviceTriggers => {
                "ongoing management advice and the thresholds that should prompt a change"
            }
            Self::RedFlagsEmergencyReturn => {
                "symptoms or values that require urgent care or an emergency return"
            }
            Self::FollowUpPlan => "follow-up visits, repeat investigations and their timing",
            Self::IntegratedReportSummary => {
                "a concise narrative tying the findings, risks and plan together"
            }
        }
    }

    pub fn title(&self) -> String {
        title_case(self.key())
    }
}

/// Keys of the focused single-document review, in order.
pub const REVIEW_SECTION_KEYS: [&str; 9] = [
    "document_info",
    "patient_info",
    "laboratory_results",
    "vital_signs",
    "clinical_findings",
    "calculations",
    "interpretations",
    "recommendations",
    "integrated_summary",
];

/// Stand-in for a section the model left out or left empty.
pub fn insufficient_data() -> Value {
    json!({
        "status": "insufficient_data",
        "note": "The available patient data and documents did not support this section."
    })
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Keep exactly `keys`. Unknown keys are dropped; missing, null
/// or empty ones become `insufficient_data()`. Returns the backfilled keys.
pub fn backfill_sections(
    mut source: Map<String, Value>,
    keys: &[&'static str],
) -> (Map<String, Value>, Vec<&'static str>) {
    let mut sections = Map::new();
    let mut backfilled = Vec::new();
    for key in keys {
        match source.remove(*key) {
            Some(value) if !is_blank(&value) => {
                sections.insert((*key).to_string(), value);
            }
            _ => {
                sections.insert((*key).to_string(), insufficient_data());
                backfilled.push(*key);
            }
        }
    }
    if !source.is_empty() {
        tracing::debug!(dropped = source.len(), "Unknown section keys dropped");
    }
    (sections, backfilled)
}

pub fn report_section_keys() -> [&'static str; 10] {
    ReportSection::ALL.map(|s| s.key())
}

/// The ten-section analysis. Serializes to an object with exactly the ten
/// section keys, in report order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalAnalysis {
    pub patient_info: Value,
    pub examination_findings: Value,
    pub risk_stratification: Value,
    pub key_calculations: Value,
    pub individualized_diet_plan: Value,
    pub exercise_physiotherapy_plan: Value,
    pub management_advice_triggers: Value,
    pub red_flags_emergency_return: Value,
    pub follow_up_plan: Value,
    pub integrated_report_summary: Value,
}

impl MedicalAnalysis {
    /// Build from arbitrary model output, backfilling what is missing.
    pub fn from_sections(source: Map<String, Value>) -> (Self, Vec<&'static str>) {
        let (mut sections, backfilled) = backfill_sections(source, &report_section_keys());
        let mut take = |section: ReportSection| {
            sections
                .remove(section.key())
                .unwrap_or_else(insufficient_data)
        };
        let analysis = Self {
            patient_info: take(ReportSection::PatientInfo),
            examination_findings: take(ReportSection::ExaminationFindings),
            risk_stratification: take(ReportSection::RiskStratification),
            key_calculations: take(ReportSection::KeyCalculations),
            individualized_diet_plan: take(ReportSection::IndividualizedDietPlan),
            exercise_physiotherapy_plan: take(ReportSection::ExercisePhysiotherapyPlan),
            management_advice_triggers: take(ReportSection::ManagementAdviceTriggers),
            red_flags_emergency_return: take(ReportSection::RedFlagsEmergencyReturn),
            follow_up_plan: take(ReportSection::FollowUpPlan),
            integrated_report_summary: take(ReportSection::IntegratedReportSummary),
        };
        (analysis, backfilled)
    }

    pub fn section(&self, section: ReportSection) -> &Value {
        match section {
            ReportSection::PatientInfo => &self.patient_info,
            ReportSection::ExaminationFindings => &self.examination_findings,
            ReportSection::RiskStratification => &self.risk_stratification,
            ReportSection::KeyCalculations => &self.key_calculations,
            ReportSection::IndividualizedDietPlan => &self.individualized_diet_plan,
            ReportSection::ExercisePhysiotherapyPlan => &self.exercise_physiotherapy_plan,
            ReportSection::ManagementAdviceTriggers => &self.management_advice_triggers,
            ReportSection::RedFlagsEmergencyReturn => &self.red_flags_emergency_return,
            ReportSection::FollowUpPlan => &self.follow_up_plan,
            ReportSection::IntegratedReportSummary => &self.integrated_report_summary,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReportSection, &Value)> {
        ReportSection::ALL.into_iter().map(move |s| (s, self.section(s)))
    }
}

/// `"red_flags_emergency_return"` → `"Red Flags Emergency Return"`
pub fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
