//! Album review scoring.
//!
//! Three categorical answers on a 1..=5 scale are pushed through a power curve
//! that exaggerates the extremes, weighted, and rescaled onto `[2.0, 10.0]`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Below 1.0 extremes are amplified; 1.0 is linear.
const CURVE_EXPONENT: f64 = 0.8;
const SCORE_FLOOR: f64 = 2.0;
const SCORE_CEILING: f64 = 10.0;

pub const WEIGHT_CONSISTENCY: f64 = 0.3;
pub const WEIGHT_IMPACT: f64 = 0.4;
pub const WEIGHT_GUT_CHECK: f64 = 0.3;

pub const MIN_ANSWER: u8 = 1;
pub const MAX_ANSWER: u8 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReviewError {
    #[error("{question} answer {value} is outside 1..=5")]
    AnswerOutOfRange { question: &'static str, value: u8 },
}

/// Answers to the three review questions: how consistent the tracks were, how
/// much the album hit while listening, and the gut reaction once it ended.
///
/// Only constructed through [`Answers::new`], so every value is in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AnswerValues")]
pub struct Answers {
    consistency: u8,
    impact: u8,
    gut_check: u8,
}

#[derive(Deserialize)]
struct AnswerValues {
    consistency: u8,
    impact: u8,
    gut_check: u8,
}

impl TryFrom<AnswerValues> for Answers {
    type Error = ReviewError;

    fn try_from(values: AnswerValues) -> Result<Self, Self::Error> {
        Self::new(values.consistency, values.impact, values.gut_check)
    }
}

impl Answers {
    pub fn new(consistency: u8, impact: u8, gut_check: u8) -> Result<Self, ReviewError> {
        let answers = Self {
            consistency,
            impact,
            gut_check,
        };
        answers.validate()?;
        Ok(answers)
    }

    pub fn consistency(&self) -> u8 {
        self.consistency
    }

    pub fn impact(&self) -> u8 {
        self.impact
    }

    pub fn gut_check(&self) -> u8 {
        self.gut_check
    }

    fn validate(&self) -> Result<(), ReviewError> {
        for (question, value) in [
            ("consistency", self.consistency),
            ("impact", self.impact),
            ("gut check", self.gut_check),
        ] {
            if !(MIN_ANSWER..=MAX_ANSWER).contains(&value) {
                return Err(ReviewError::AnswerOutOfRange { question, value });
            }
        }
        Ok(())
    }

    /// Weighted score rounded to one decimal.
    pub fn score(&self) -> f64 {
        let raw = curve(self.consistency) * WEIGHT_CONSISTENCY
            + curve(self.impact) * WEIGHT_IMPACT
            + curve(self.gut_check) * WEIGHT_GUT_CHECK;
        let score = SCORE_FLOOR + ((raw - 1.0) / 4.0) * (SCORE_CEILING - SCORE_FLOOR);
        (score * 10.0).round() / 10.0
    }
}

fn curve(answer: u8) -> f64 {
    let normalized = (f64::from(answer) - 3.0) / 2.0;
    let curved = normalized.abs().powf(CURVE_EXPONENT).copysign(normalized);
    curved * 2.0 + 3.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreLabel {
    Dnr,
    Nope,
    NotForMe,
    HasItsMoments,
    GoodNotGreat,
    WouldRecommend,
    EssentialListening,
    InstantClassic,
    Masterpiece,
}

impl ScoreLabel {
    pub fn for_score(score: f64) -> Self {
        match score {
            s if s < 2.0 => Self::Dnr,
            s if s < 4.0 => Self::Nope,
            s if s < 6.0 => Self::NotForMe,
            s if s < 6.6 => Self::HasItsMoments,
            s if s < 7.0 => Self::GoodNotGreat,
            s if s < 8.0 => Self::WouldRecommend,
            s if s < 9.0 => Self::EssentialListening,
            s if s < 10.0 => Self::InstantClassic,
            _ => Self::Masterpiece,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dnr => "DNR",
            Self::Nope => "Nope",
            Self::NotForMe => "Not For Me",
            Self::HasItsMoments => "Has Its Moments",
            Self::GoodNotGreat => "Good Not Great",
            Self::WouldRecommend => "Would Recommend",
            Self::EssentialListening => "Essential Listening",
            Self::InstantClassic => "Instant Classic",
            Self::Masterpiece => "Masterpiece",
        }
    }
}

impl fmt::Display for ScoreLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub answers: Answers,
    pub score: f64,
    pub label: ScoreLabel,
}

impl Review {
    pub fn from_answers(answers: Answers) -> Self {
        let score = answers.score();
        Self {
            answers,
            score,
            label: ScoreLabel::for_score(score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_answers() -> impl Iterator<Item = Answers> {
        (MIN_ANSWER..=MAX_ANSWER).flat_map(|c| {
            (MIN_ANSWER..=MAX_ANSWER).flat_map(move |i| {
                (MIN_ANSWER..=MAX_ANSWER).map(move |g| Answers::new(c, i, g).unwrap())
            })
        })
    }

    #[test]
    fn extremes_hit_floor_and_ceiling() {
        assert_eq!(Answers::new(5, 5, 5).unwrap().score(), 10.0);
        assert_eq!(Answers::new(1, 1, 1).unwrap().score(), 2.0);
        assert_eq!(Answers::new(3, 3, 3).unwrap().score(), 6.0);
    }

    #[test]
    fn every_score_is_within_bounds() {
        for answers in all_answers() {
            let score = answers.score();
            assert!((2.0..=10.0).contains(&score), "{answers:?} -> {score}");
        }
    }

    #[test]
    fn raising_any_single_answer_never_lowers_the_score() {
        for answers in all_answers() {
            let base = answers.score();
            let (c, i, g) = (answers.consistency(), answers.impact(), answers.gut_check());
            for up in [
                Answers::new(c + 1, i, g),
                Answers::new(c, i + 1, g),
                Answers::new(c, i, g + 1),
            ]
            .into_iter()
            .flatten()
            {
                assert!(up.score() >= base, "{answers:?} -> {up:?}");
            }
        }
    }

    #[test]
    fn impact_weighs_more_than_the_other_questions() {
        let impact_high = Answers::new(3, 5, 3).unwrap().score();
        let consistency_high = Answers::new(5, 3, 3).unwrap().score();
        assert!(impact_high > consistency_high);
    }

    #[test]
    fn out_of_range_answers_are_rejected() {
        assert_eq!(
            Answers::new(0, 3, 3).unwrap_err(),
            ReviewError::AnswerOutOfRange {
                question: "consistency",
                value: 0
            }
        );
        assert!(Answers::new(3, 3, 6).is_err());
    }

    #[test]
    fn deserializing_validates_answers() {
        let answers: Answers =
            serde_json::from_str(r#"{"consistency":4,"impact":5,"gut_check":3}"#).unwrap();
        assert_eq!(answers, Answers::new(4, 5, 3).unwrap());

        let err = serde_json::from_str::<Answers>(r#"{"consistency":0,"impact":5,"gut_check":3}"#)
            .unwrap_err();
        assert!(err.to_string().contains("consistency answer 0 is outside 1..=5"));
    }

    #[test]
    fn labels_follow_thresholds() {
        assert_eq!(ScoreLabel::for_score(2.0), ScoreLabel::Nope);
        assert_eq!(ScoreLabel::for_score(6.5), ScoreLabel::HasItsMoments);
        assert_eq!(ScoreLabel::for_score(6.6), ScoreLabel::GoodNotGreat);
        assert_eq!(ScoreLabel::for_score(9.9), ScoreLabel::InstantClassic);
        assert_eq!(ScoreLabel::for_score(10.0), ScoreLabel::Masterpiece);

        let review = Review::from_answers(Answers::new(5, 5, 5).unwrap());
        assert_eq!(review.label.to_string(), "Masterpiece");
    }
}
