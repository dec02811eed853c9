// Fill-in-blank grading
//
// Pure and infallible for user answers. Only a malformed blank
// configuration is an error, and only through `validate_config`.

use crate::error::BlankConfigError;
use gauntlet_common::types::{BlankConfig, BlankResult, FillInBlankResult};
use std::collections::{HashMap, HashSet};

fn answer_matches(answer: &str, blank: &BlankConfig) -> bool {
    let answer = answer.trim();
    blank.correct_answers.iter().any(|correct| {
        let correct = correct.trim();
        if blank.case_sensitive {
            answer == correct
        } else {
            answer.to_lowercase() == correct.to_lowercase()
        }
    })
}

/// Grade answers keyed by blank id. A missing answer is incorrect, never
/// an error. Zero blanks is never all-correct.
pub fn grade(answers: &HashMap<String, String>, blanks: &[BlankConfig]) -> FillInBlankResult {
    let results: Vec<BlankResult> = blanks
        .iter()
        .map(|blank| {
            let user_answer = answers.get(&blank.id).cloned();
            let is_correct = user_answer
                .as_deref()
                .map_or(false, |answer| answer_matches(answer, blank));

            BlankResult {
                id: blank.id.clone(),
                user_answer,
                is_correct,
                points_earned: if is_correct { blank.points } else { 0 },
                possible_points: blank.points,
            }
        })
        .collect();

    let total_points = results.iter().map(|r| r.points_earned).sum();
    let total_possible_points = results.iter().map(|r| r.possible_points).sum();
    let all_correct = !results.is_empty() && results.iter().all(|r| r.is_correct);

    FillInBlankResult {
        results,
        total_points,
        total_possible_points,
        all_correct,
    }
}

/// Reject configurations no answer could ever satisfy
pub fn validate_config(blanks: &[BlankConfig]) -> Result<(), BlankConfigError> {
    let mut seen = HashSet::new();

    for (position, blank) in blanks.iter().enumerate() {
        let id = blank.id.trim();
        if id.is_empty() {
            return Err(BlankConfigError::EmptyId(position));
        }
        if !seen.insert(id) {
            return Err(BlankConfigError::DuplicateId(id.to_string()));
        }
        if blank.correct_answers.is_empty() {
            return Err(BlankConfigError::NoCorrectAnswers(id.to_string()));
        }
        if blank.correct_answers.iter().any(|a| a.trim().is_empty()) {
            return Err(BlankConfigError::EmptyCorrectAnswer(id.to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(id, answer)| (id.to_string(), answer.to_string()))
            .collect()
    }

    #[test]
    fn test_case_sensitive_by_default() {
        let blanks = vec![BlankConfig::new("b", &["hello"])];
        let result = grade(&answers(&[("b", "HELLO")]), &blanks);
        assert!(!result.all_correct);
        assert_eq!(result.total_points, 0);

        let mut insensitive = blanks.clone();
        insensitive[0].case_sensitive = false;
        let result = grade(&answers(&[("b", "HELLO")]), &insensitive);
        assert!(result.all_correct);
        assert_eq!(result.total_points, 1);
    }

    #[test]
    fn test_answers_are_trimmed() {
        let blanks = vec![BlankConfig::new("b", &["let"])];
        assert!(grade(&answers(&[("b", "  let \n")]), &blanks).all_correct);
    }

    #[test]
    fn test_any_listed_answer_is_accepted() {
        let mut blank = BlankConfig::new("kw", &["const", "let"]);
        blank.points = 3;
        let result = grade(&answers(&[("kw", "let")]), &[blank]);
        assert_eq!(result.total_points, 3);
        assert_eq!(result.total_possible_points, 3);
    }

    #[test]
    fn test_missing_answer_scores_zero() {
        let blanks = vec![BlankConfig::new("a", &["x"]), BlankConfig::new("b", &["y"])];
        let result = grade(&answers(&[("a", "x")]), &blanks);

        assert!(!result.all_correct);
        assert_eq!(result.total_points, 1);
        assert_eq!(result.total_possible_points, 2);
        assert_eq!(result.results[1].user_answer, None);
        assert!(!result.results[1].is_correct);
    }

    #[test]
    fn test_no_blanks_is_never_all_correct() {
        let result = grade(&answers(&[("a", "x")]), &[]);
        assert!(!result.all_correct);
        assert_eq!(result.total_points, 0);
        assert_eq!(result.total_possible_points, 0);
        assert!(result.results.is_empty());
    }

    #[test]
    fn test_grading_is_deterministic() {
        let blanks = vec![BlankConfig::new("a", &["x"]), BlankConfig::new("b", &["y"])];
        let given = answers(&[("a", "x"), ("b", "z")]);
        assert_eq!(grade(&given, &blanks), grade(&given, &blanks));
    }

    #[test]
    fn test_validate_config() {
        assert_eq!(validate_config(&[BlankConfig::new("a", &["x"])]), Ok(()));
        assert_eq!(validate_config(&[]), Ok(()));

        assert_eq!(
            validate_config(&[BlankConfig::new(" ", &["x"])]),
            Err(BlankConfigError::EmptyId(0))
        );
        assert_eq!(
            validate_config(&[BlankConfig::new("a", &["x"]), BlankConfig::new("a", &["y"])]),
            Err(BlankConfigError::DuplicateId("a".to_string()))
        );
        assert_eq!(
            validate_config(&[BlankConfig::new("a", &[])]),
            Err(BlankConfigError::NoCorrectAnswers("a".to_string()))
        );
        assert_eq!(
            validate_config(&[BlankConfig::new("a", &["x", "  "])]),
            Err(BlankConfigError::EmptyCorrectAnswer("a".to_string()))
        );
    }
}
