use serde::{Deserialize, Serialize};

pub const CA_MAX: i64 = 20;
pub const EXAM_MAX: i64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct ScoringError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoringError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Closed-interval threshold mapping; boundary values belong to the
    /// higher grade (75 => A, 74 => B). Totals outside 0..=100 are rejected.
    pub fn for_total(total: i64) -> Result<Grade, ScoringError> {
        if !(0..=100).contains(&total) {
            return Err(ScoringError::with_details(
                "range_error",
                format!("total {} outside 0..=100", total),
                serde_json::json!({ "total": total }),
            ));
        }
        Ok(match total {
            75..=100 => Grade::A,
            65..=74 => Grade::B,
            55..=64 => Grade::C,
            45..=54 => Grade::D,
            _ => Grade::F,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    pub fn remark(&self) -> &'static str {
        match self {
            Grade::A => "Excellent",
            Grade::B => "Very Good",
            Grade::C => "Good",
            Grade::D => "Fair",
            Grade::F => "Fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    First,
    Second,
    Third,
}

impl Term {
    pub fn parse(s: &str) -> Option<Term> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Some(Term::First),
            "second" => Some(Term::Second),
            "third" => Some(Term::Third),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Term::First => "first",
            Term::Second => "second",
            Term::Third => "third",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Approved,
    Rejected,
}

impl Status {
    pub fn parse(s: &str) -> Option<Status> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Status::Pending),
            "APPROVED" => Some(Status::Approved),
            "REJECTED" => Some(Status::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Approved => "APPROVED",
            Status::Rejected => "REJECTED",
        }
    }
}

/// Pure arithmetic sum; inputs must already be range-checked.
pub fn subject_total(ca1: i64, ca2: i64, exam: i64) -> i64 {
    ca1 + ca2 + exam
}

pub fn validate_marks(name: &str, ca1: i64, ca2: i64, exam: i64) -> Result<(), ScoringError> {
    let check = |field: &str, value: i64, max: i64| -> Result<(), ScoringError> {
        if !(0..=max).contains(&value) {
            return Err(ScoringError::with_details(
                "range_error",
                format!("{} for '{}' must be within 0..={}", field, name, max),
                serde_json::json!({ "subject": name, "field": field, "value": value, "max": max }),
            ));
        }
        Ok(())
    };
    check("ca1", ca1, CA_MAX)?;
    check("ca2", ca2, CA_MAX)?;
    check("exam", exam, EXAM_MAX)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    pub name: String,
    pub ca1: i64,
    pub ca2: i64,
    pub exam: i64,
    pub total: i64,
    pub grade: String,
    pub remark: String,
}

pub fn score_subject(name: &str, ca1: i64, ca2: i64, exam: i64) -> Result<SubjectScore, ScoringError> {
    validate_marks(name, ca1, ca2, exam)?;
    let total = subject_total(ca1, ca2, exam);
    let grade = Grade::for_total(total)?;
    Ok(SubjectScore {
        name: name.to_string(),
        ca1,
        ca2,
        exam,
        total,
        grade: grade.as_str().to_string(),
        remark: grade.remark().to_string(),
    })
}

/// VB6-compatible 2-decimal rounding: `Int(100*x + 0.5) / 100`.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Recomputed fresh from the current subject entries every time; a stored
/// total is never trusted.
pub fn result_totals(subjects: &[SubjectScore]) -> Result<(i64, f64), ScoringError> {
    if subjects.is_empty() {
        return Err(ScoringError::new(
            "empty_subjects",
            "cannot average zero subjects",
        ));
    }
    let total_score: i64 = subjects.iter().map(|s| s.total).sum();
    let average = round_off_2_decimals(total_score as f64 / subjects.len() as f64);
    Ok((total_score, average))
}

#[derive(Debug, Clone)]
pub struct RankEntry {
    pub result_id: String,
    pub student_id: String,
    pub total_score: i64,
}

/// Descending by total score; equal totals break by ascending student id,
/// then result id, so rank never depends on storage iteration order.
pub fn rank_order(scope: &[RankEntry]) -> Vec<RankEntry> {
    let mut sorted = scope.to_vec();
    sorted.sort_by(|a, b| {
        b.total_score
            .cmp(&a.total_score)
            .then_with(|| a.student_id.cmp(&b.student_id))
            .then_with(|| a.result_id.cmp(&b.result_id))
    });
    sorted
}

/// Scope = every APPROVED result sharing (class, term, session). Arm is not
/// part of the scope; rank is class-wide.
pub fn class_rank(candidate_result_id: &str, scope: &[RankEntry]) -> Result<(i64, i64), ScoringError> {
    let sorted = rank_order(scope);
    let position = sorted
        .iter()
        .position(|e| e.result_id == candidate_result_id)
        .ok_or_else(|| {
            ScoringError::with_details(
                "not_in_scope",
                "candidate result missing from its own ranking scope",
                serde_json::json!({ "resultId": candidate_result_id }),
            )
        })?;
    Ok((position as i64 + 1, sorted.len() as i64))
}

/// Session names are academic years like "2024/2025": two consecutive
/// four-digit years.
pub fn session_name_is_valid(name: &str) -> bool {
    let mut parts = name.split('/');
    let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if a.len() != 4 || b.len() != 4 {
        return false;
    }
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => y == x + 1,
        _ => false,
    }
}

pub fn default_class_teacher_remark(average: f64, position: i64) -> &'static str {
    match position {
        1 => "Excellent performance! You're the best. Keep it up.",
        2 => "Very good work. Aim for the top next time.",
        3 => "Good effort. You can move higher.",
        _ => {
            if average >= 65.0 {
                "Very good work. Can do even better."
            } else if average >= 55.0 {
                "Good result. Put in more effort."
            } else if average >= 45.0 {
                "Fair result. Needs improvement."
            } else if average >= 40.0 {
                "Below average. Work harder."
            } else {
                "Poor performance. See me immediately."
            }
        }
    }
}

pub fn default_principal_remark(average: f64, position: i64) -> &'static str {
    match position {
        1 => "Promoted to next class with distinction. Excellent!",
        2 => "Promoted to next class with merit. Very good.",
        3 => "Promoted to next class. Good performance.",
        _ => {
            if average >= 60.0 {
                "Promoted. Very good performance."
            } else if average >= 50.0 {
                "Promoted. Can improve."
            } else if average >= 45.0 {
                "Promoted on trial. Work harder."
            } else {
                "Not promoted. Repeat class."
            }
        }
    }
}

pub fn default_recommendation(average: f64, position: i64) -> &'static str {
    match position {
        1 => "Highly Recommended for Academic Scholarship",
        2 => "Recommended for Science/Arts Stream",
        3 => "Recommended for Competitive Exams",
        _ => {
            if average >= 65.0 {
                "Recommended for Science/Arts"
            } else if average >= 55.0 {
                "Recommended for Technical/Vocational"
            } else if average >= 45.0 {
                "Recommended with Monitoring"
            } else {
                "Needs Remedial Classes"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(name: &str, ca1: i64, ca2: i64, exam: i64) -> SubjectScore {
        score_subject(name, ca1, ca2, exam).expect("score subject")
    }

    #[test]
    fn subject_total_is_plain_sum() {
        assert_eq!(subject_total(0, 0, 0), 0);
        assert_eq!(subject_total(20, 20, 60), 100);
        assert_eq!(subject_total(18, 19, 55), 92);
    }

    #[test]
    fn grade_boundaries_belong_to_higher_grade() {
        assert_eq!(Grade::for_total(100).unwrap(), Grade::A);
        assert_eq!(Grade::for_total(75).unwrap(), Grade::A);
        assert_eq!(Grade::for_total(74).unwrap(), Grade::B);
        assert_eq!(Grade::for_total(65).unwrap(), Grade::B);
        assert_eq!(Grade::for_total(64).unwrap(), Grade::C);
        assert_eq!(Grade::for_total(55).unwrap(), Grade::C);
        assert_eq!(Grade::for_total(54).unwrap(), Grade::D);
        assert_eq!(Grade::for_total(45).unwrap(), Grade::D);
        assert_eq!(Grade::for_total(44).unwrap(), Grade::F);
        assert_eq!(Grade::for_total(0).unwrap(), Grade::F);
    }

    #[test]
    fn grade_never_improves_as_total_decreases() {
        let quality = |g: Grade| match g {
            Grade::A => 4,
            Grade::B => 3,
            Grade::C => 2,
            Grade::D => 1,
            Grade::F => 0,
        };
        let mut prev = quality(Grade::for_total(100).unwrap());
        for total in (0..100).rev() {
            let q = quality(Grade::for_total(total).unwrap());
            assert!(q <= prev, "grade improved when total dropped to {}", total);
            prev = q;
        }
    }

    #[test]
    fn grade_rejects_out_of_range_totals() {
        assert_eq!(Grade::for_total(-1).unwrap_err().code, "range_error");
        assert_eq!(Grade::for_total(101).unwrap_err().code, "range_error");
    }

    #[test]
    fn marks_outside_caps_are_rejected() {
        assert!(validate_marks("Maths", 0, 0, 0).is_ok());
        assert!(validate_marks("Maths", 20, 20, 60).is_ok());
        assert_eq!(validate_marks("Maths", 21, 0, 0).unwrap_err().code, "range_error");
        assert_eq!(validate_marks("Maths", 0, -1, 0).unwrap_err().code, "range_error");
        assert_eq!(validate_marks("Maths", 0, 0, 61).unwrap_err().code, "range_error");
    }

    #[test]
    fn score_subject_derives_total_grade_and_remark() {
        let s = scored("Mathematics", 18, 19, 55);
        assert_eq!(s.total, 92);
        assert_eq!(s.grade, "A");
        assert_eq!(s.remark, "Excellent");

        let s = scored("English", 14, 15, 42);
        assert_eq!(s.total, 71);
        assert_eq!(s.grade, "B");
        assert_eq!(s.remark, "Very Good");
    }

    #[test]
    fn result_totals_matches_known_report_card() {
        // 92 + 79 + 85 over three subjects.
        let subjects = vec![
            scored("Mathematics", 18, 19, 55),
            scored("English", 15, 16, 48),
            scored("Physics", 17, 18, 50),
        ];
        let (total, average) = result_totals(&subjects).unwrap();
        assert_eq!(total, 256);
        assert!((average - 85.33).abs() < 1e-9);
    }

    #[test]
    fn result_totals_rejects_empty_subjects() {
        assert_eq!(result_totals(&[]).unwrap_err().code, "empty_subjects");
    }

    fn entry(result_id: &str, student_id: &str, total: i64) -> RankEntry {
        RankEntry {
            result_id: result_id.to_string(),
            student_id: student_id.to_string(),
            total_score: total,
        }
    }

    #[test]
    fn class_rank_orders_by_total_descending() {
        let scope = vec![
            entry("rx", "STU-X", 92),
            entry("ry", "STU-Y", 256),
            entry("rz", "STU-Z", 150),
        ];
        assert_eq!(class_rank("ry", &scope).unwrap(), (1, 3));
        assert_eq!(class_rank("rz", &scope).unwrap(), (2, 3));
        assert_eq!(class_rank("rx", &scope).unwrap(), (3, 3));
    }

    #[test]
    fn class_rank_is_idempotent_over_unchanged_scope() {
        let scope = vec![entry("r1", "STU-A", 200), entry("r2", "STU-B", 180)];
        let first = class_rank("r2", &scope).unwrap();
        let second = class_rank("r2", &scope).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, (2, 2));
    }

    #[test]
    fn equal_totals_break_ties_by_student_id() {
        let scope = vec![
            entry("r2", "STU-B", 200),
            entry("r1", "STU-A", 200),
            entry("r3", "STU-C", 150),
        ];
        assert_eq!(class_rank("r1", &scope).unwrap(), (1, 3));
        assert_eq!(class_rank("r2", &scope).unwrap(), (2, 3));
        assert_eq!(class_rank("r3", &scope).unwrap(), (3, 3));

        // Same entries, different iteration order; positions must not move.
        let shuffled = vec![
            entry("r3", "STU-C", 150),
            entry("r1", "STU-A", 200),
            entry("r2", "STU-B", 200),
        ];
        assert_eq!(class_rank("r1", &shuffled).unwrap(), (1, 3));
        assert_eq!(class_rank("r2", &shuffled).unwrap(), (2, 3));
    }

    #[test]
    fn class_rank_flags_missing_candidate() {
        let scope = vec![entry("r1", "STU-A", 90)];
        assert_eq!(class_rank("r9", &scope).unwrap_err().code, "not_in_scope");
    }

    #[test]
    fn round_off_matches_vb6_two_decimal_form() {
        assert_eq!(round_off_2_decimals(85.333333), 85.33);
        assert_eq!(round_off_2_decimals(85.336), 85.34);
        assert_eq!(round_off_2_decimals(85.331), 85.33);
        assert_eq!(round_off_2_decimals(0.0), 0.0);
    }

    #[test]
    fn session_names_must_be_consecutive_years() {
        assert!(session_name_is_valid("2024/2025"));
        assert!(!session_name_is_valid("2024/2026"));
        assert!(!session_name_is_valid("2024-2025"));
        assert!(!session_name_is_valid("24/25"));
        assert!(!session_name_is_valid("2024/2025/2026"));
    }

    #[test]
    fn term_and_status_round_trip() {
        assert_eq!(Term::parse("first"), Some(Term::First));
        assert_eq!(Term::parse("Second"), Some(Term::Second));
        assert_eq!(Term::parse("THIRD"), Some(Term::Third));
        assert_eq!(Term::parse("fourth"), None);
        assert_eq!(Term::First.as_str(), "first");

        assert_eq!(Status::parse("pending"), Some(Status::Pending));
        assert_eq!(Status::parse("APPROVED"), Some(Status::Approved));
        assert_eq!(Status::parse("done"), None);
        assert_eq!(Status::Rejected.as_str(), "REJECTED");
    }

    #[test]
    fn top_three_positions_drive_default_remarks() {
        assert_eq!(
            default_class_teacher_remark(90.0, 1),
            "Excellent performance! You're the best. Keep it up."
        );
        assert_eq!(
            default_principal_remark(40.0, 2),
            "Promoted to next class with merit. Very good."
        );
        assert_eq!(
            default_recommendation(70.0, 3),
            "Recommended for Competitive Exams"
        );
    }

    #[test]
    fn average_thresholds_drive_default_remarks_below_top_three() {
        assert_eq!(
            default_class_teacher_remark(66.0, 5),
            "Very good work. Can do even better."
        );
        assert_eq!(
            default_class_teacher_remark(39.0, 9),
            "Poor performance. See me immediately."
        );
        assert_eq!(default_principal_remark(44.0, 8), "Not promoted. Repeat class.");
        assert_eq!(default_recommendation(44.0, 8), "Needs Remedial Classes");
    }
}
