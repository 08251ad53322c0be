//! Hybrid similarity scoring and popularity fallback.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::matrix::UserItemMatrix;

/// Blend factors for behavior vs attribute similarity.
const BEHAVIOR_WEIGHT: f64 = 0.7;
const ATTRIBUTE_WEIGHT: f64 = 0.3;

/// One `(user, course) -> Σ action_value` aggregate from the behavior log.
#[derive(Debug, Clone)]
pub struct BehaviorAggregate {
    pub user_id: i64,
    pub course_id: i64,
    pub total_weight: f64,
}

/// Catalogue attributes that drive the content half of the hybrid score.
#[derive(Debug, Clone)]
pub struct CourseAttributes {
    pub id: i64,
    pub medical_department: String,
    pub difficulty_level: i16,
    pub applicable_title: Option<String>,
    /// 1 = published.
    pub status: i16,
    /// 1 = on sale.
    pub sale_status: i16,
    pub created_time: DateTime<Utc>,
}

impl CourseAttributes {
    pub fn is_active(&self) -> bool {
        self.status == 1 && self.sale_status == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendReason {
    History,
    Popular,
}

impl RecommendReason {
    pub fn label(self) -> &'static str {
        match self {
            RecommendReason::History => "recommended from your learning history",
            RecommendReason::Popular => "popular",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub course_id: i64,
    pub score: f64,
    pub reason: RecommendReason,
}

/// Attribute similarity between two courses, clamped to `[0, 1]`:
/// `+0.5` matching department, `+max(0, 0.3 − 0.1·|Δdifficulty|)`,
/// `+0.2` equal present applicable title.
pub fn attribute_similarity(a: &CourseAttributes, b: &CourseAttributes) -> f64 {
    let mut score = 0.0;

    if a.medical_department == b.medical_department {
        score += 0.5;
    }

    let difficulty_diff = (a.difficulty_level - b.difficulty_level).abs() as f64;
    score += (0.3 - difficulty_diff * 0.1).max(0.0);

    if let (Some(ta), Some(tb)) = (&a.applicable_title, &b.applicable_title) {
        if ta == tb {
            score += 0.2;
        }
    }

    score.clamp(0.0, 1.0)
}

pub struct Recommender;

impl Recommender {
    /// Produce at most `top_n` recommendations for `user_id`.
    ///
    /// `rows` is the whole behavior log aggregated by `(user, course)`;
    /// `courses` is the course catalogue. Cold start (no history) and thin
    /// catalogues fall back to popularity; an under-filled history result is
    /// topped up the same way.
    pub fn recommend(
        rows: &[BehaviorAggregate],
        courses: &[CourseAttributes],
        user_id: i64,
        top_n: usize,
        exclude_interacted: bool,
    ) -> Vec<Recommendation> {
        if top_n == 0 {
            return Vec::new();
        }

        let user_courses: HashMap<i64, f64> = rows
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| (r.course_id, r.total_weight))
            .collect();

        if user_courses.is_empty() {
            debug!(user_id, "no interaction history, serving popular courses");
            return Self::popular(rows, courses, top_n, &HashSet::new());
        }

        let matrix = UserItemMatrix::build(rows);
        if matrix.course_count() < 2 {
            return Self::popular(rows, courses, top_n, &HashSet::new());
        }

        let similarity = Self::hybrid_similarity(&matrix, courses);
        let catalogue: HashMap<i64, &CourseAttributes> =
            courses.iter().map(|c| (c.id, c)).collect();

        // Score every candidate column against the user's interacted set.
        let mut scored: Vec<(i64, f64)> = Vec::new();
        for (candidate_idx, &candidate_id) in matrix.course_ids.iter().enumerate() {
            if exclude_interacted && user_courses.contains_key(&candidate_id) {
                continue;
            }

            let mut score = 0.0;
            for (interacted_id, user_score) in &user_courses {
                if let Ok(interacted_idx) = matrix.course_ids.binary_search(interacted_id) {
                    score += similarity[candidate_idx][interacted_idx] * user_score;
                }
            }

            if score > 0.0 {
                scored.push((candidate_id, score));
            }
        }

        sort_scored(&mut scored);
        scored.truncate(top_n);

        let mut recommendations: Vec<Recommendation> = scored
            .into_iter()
            .filter(|(id, _)| catalogue.get(id).map_or(false, |c| c.is_active()))
            .map(|(course_id, score)| Recommendation {
                course_id,
                score,
                reason: RecommendReason::History,
            })
            .collect();

        // Top up with popular courses when history alone can't fill N.
        if recommendations.len() < top_n {
            let mut exclude: HashSet<i64> =
                recommendations.iter().map(|r| r.course_id).collect();
            exclude.extend(user_courses.keys().copied());
            let fill = Self::popular(
                rows,
                courses,
                top_n - recommendations.len(),
                &exclude,
            );
            recommendations.extend(fill);
        }

        recommendations
    }

    /// Popularity fallback: `Σ action_value` per course over the whole log,
    /// padded with the newest active courses when the log itself is thin.
    pub fn popular(
        rows: &[BehaviorAggregate],
        courses: &[CourseAttributes],
        top_n: usize,
        exclude: &HashSet<i64>,
    ) -> Vec<Recommendation> {
        let catalogue: HashMap<i64, &CourseAttributes> =
            courses.iter().map(|c| (c.id, c)).collect();

        let mut totals: HashMap<i64, f64> = HashMap::new();
        for row in rows {
            *totals.entry(row.course_id).or_insert(0.0) += row.total_weight;
        }

        let mut ranked: Vec<(i64, f64)> = totals.into_iter().collect();
        sort_scored(&mut ranked);

        let mut chosen: Vec<i64> = Vec::new();
        for (course_id, _) in ranked {
            if chosen.len() >= top_n {
                break;
            }
            if exclude.contains(&course_id) {
                continue;
            }
            if catalogue.get(&course_id).map_or(false, |c| c.is_active()) {
                chosen.push(course_id);
            }
        }

        // Pad with the newest active courses.
        if chosen.len() < top_n {
            let mut newest: Vec<&CourseAttributes> = courses
                .iter()
                .filter(|c| {
                    c.is_active() && !exclude.contains(&c.id) && !chosen.contains(&c.id)
                })
                .collect();
            newest.sort_by(|a, b| {
                b.created_time
                    .cmp(&a.created_time)
                    .then(a.id.cmp(&b.id))
            });
            for course in newest {
                if chosen.len() >= top_n {
                    break;
                }
                chosen.push(course.id);
            }
        }

        chosen
            .into_iter()
            .map(|course_id| Recommendation {
                course_id,
                score: 0.0,
                reason: RecommendReason::Popular,
            })
            .collect()
    }

    /// `0.7 · cosine(behavior) + 0.3 · attribute`, aligned to the matrix's
    /// course index order. Courses missing from the catalogue contribute no
    /// attribute similarity.
    fn hybrid_similarity(
        matrix: &UserItemMatrix,
        courses: &[CourseAttributes],
    ) -> Vec<Vec<f64>> {
        let behavior = matrix.course_cosine_matrix();
        let catalogue: HashMap<i64, &CourseAttributes> =
            courses.iter().map(|c| (c.id, c)).collect();

        let n = matrix.course_count();
        let mut hybrid = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                let attr = if i == j {
                    1.0
                } else {
                    match (
                        catalogue.get(&matrix.course_ids[i]),
                        catalogue.get(&matrix.course_ids[j]),
                    ) {
                        (Some(a), Some(b)) => attribute_similarity(a, b),
                        _ => 0.0,
                    }
                };
                hybrid[i][j] = BEHAVIOR_WEIGHT * behavior[i][j] + ATTRIBUTE_WEIGHT * attr;
            }
        }
        hybrid
    }
}

/// Descending by score, ties broken by ascending course id so ranking is
/// stable across calls.
fn sort_scored(scored: &mut [(i64, f64)]) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn course(id: i64, department: &str, difficulty: i16) -> CourseAttributes {
        CourseAttributes {
            id,
            medical_department: department.into(),
            difficulty_level: difficulty,
            applicable_title: None,
            status: 1,
            sale_status: 1,
            created_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::days(id),
        }
    }

    fn agg(user_id: i64, course_id: i64, total_weight: f64) -> BehaviorAggregate {
        BehaviorAggregate {
            user_id,
            course_id,
            total_weight,
        }
    }

    // ── attribute similarity ─────────────────────────────────

    #[test]
    fn attribute_similarity_components() {
        let a = course(1, "cardiology", 2);
        let b = course(2, "cardiology", 2);
        // Same department (+0.5) + zero difficulty gap (+0.3).
        assert!((attribute_similarity(&a, &b) - 0.8).abs() < 1e-9);

        let c = course(3, "neurology", 4);
        // Different department, |Δ| = 2 → +0.1 only.
        assert!((attribute_similarity(&a, &c) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn attribute_similarity_titles_and_clamp() {
        let mut a = course(1, "cardiology", 2);
        let mut b = course(2, "cardiology", 2);
        a.applicable_title = Some("attending".into());
        b.applicable_title = Some("attending".into());
        // 0.5 + 0.3 + 0.2 = 1.0, exactly at the clamp boundary.
        assert_eq!(attribute_similarity(&a, &b), 1.0);

        b.applicable_title = Some("resident".into());
        assert!((attribute_similarity(&a, &b) - 0.8).abs() < 1e-9);

        // Title on only one side contributes nothing.
        b.applicable_title = None;
        assert!((attribute_similarity(&a, &b) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn large_difficulty_gap_bottoms_out() {
        let a = course(1, "cardiology", 1);
        let b = course(2, "neurology", 4);
        // max(0, 0.3 - 0.3) = 0, no department or title match.
        assert_eq!(attribute_similarity(&a, &b), 0.0);
    }

    // ── cold start ───────────────────────────────────────────

    #[test]
    fn cold_start_user_gets_only_popular() {
        let rows = vec![agg(1, 10, 5.0), agg(2, 11, 3.0)];
        let courses = vec![course(10, "cardiology", 2), course(11, "neurology", 3)];

        let recs = Recommender::recommend(&rows, &courses, 42, 5, true);
        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| r.reason == RecommendReason::Popular));
        // Popularity order: course 10 (5.0) before 11 (3.0).
        assert_eq!(recs[0].course_id, 10);
    }

    #[test]
    fn cold_start_pads_with_newest_active() {
        let rows: Vec<BehaviorAggregate> = Vec::new();
        let courses = vec![
            course(1, "cardiology", 1),
            course(2, "cardiology", 2),
            course(3, "neurology", 3),
        ];

        let recs = Recommender::recommend(&rows, &courses, 42, 3, true);
        assert_eq!(recs.len(), 3);
        // created_time grows with id in the fixture, so newest-first = id desc.
        assert_eq!(recs[0].course_id, 3);
        assert!(recs.iter().all(|r| r.reason == RecommendReason::Popular));
    }

    // ── history scoring ──────────────────────────────────────

    #[test]
    fn similar_course_is_recommended_from_history() {
        // Users 2 and 3 interact with both 10 and 11, making them similar;
        // user 1 only touched 10 and should be offered 11.
        let rows = vec![
            agg(1, 10, 5.0),
            agg(2, 10, 3.0),
            agg(2, 11, 3.0),
            agg(3, 10, 2.0),
            agg(3, 11, 2.0),
        ];
        let courses = vec![course(10, "cardiology", 2), course(11, "cardiology", 2)];

        let recs = Recommender::recommend(&rows, &courses, 1, 5, true);
        assert_eq!(recs[0].course_id, 11);
        assert_eq!(recs[0].reason, RecommendReason::History);
        assert!(recs[0].score > 0.0);
    }

    #[test]
    fn interacted_courses_excluded_when_requested() {
        let rows = vec![
            agg(1, 10, 5.0),
            agg(1, 11, 2.0),
            agg(2, 10, 1.0),
            agg(2, 11, 1.0),
        ];
        let courses = vec![course(10, "cardiology", 2), course(11, "cardiology", 2)];

        let recs = Recommender::recommend(&rows, &courses, 1, 5, true);
        assert!(recs
            .iter()
            .filter(|r| r.reason == RecommendReason::History)
            .all(|r| r.course_id != 10 && r.course_id != 11));

        let recs = Recommender::recommend(&rows, &courses, 1, 5, false);
        assert!(recs.iter().any(|r| r.course_id == 10));
    }

    #[test]
    fn inactive_courses_never_recommended() {
        let mut inactive = course(11, "cardiology", 2);
        inactive.sale_status = 0;
        let rows = vec![
            agg(1, 10, 5.0),
            agg(2, 10, 3.0),
            agg(2, 11, 3.0),
        ];
        let courses = vec![course(10, "cardiology", 2), inactive];

        let recs = Recommender::recommend(&rows, &courses, 1, 5, true);
        assert!(recs.iter().all(|r| r.course_id != 11));
    }

    #[test]
    fn results_capped_at_top_n_with_unique_ids() {
        let mut rows = Vec::new();
        let mut courses = Vec::new();
        for c in 10..30 {
            courses.push(course(c, "cardiology", 2));
            rows.push(agg(1, 10, 5.0));
            rows.push(agg(2, c, 2.0));
            rows.push(agg(2, 10, 2.0));
        }

        let recs = Recommender::recommend(&rows, &courses, 1, 5, true);
        assert!(recs.len() <= 5);
        let ids: HashSet<i64> = recs.iter().map(|r| r.course_id).collect();
        assert_eq!(ids.len(), recs.len(), "ids must be unique");
    }

    #[test]
    fn ties_break_by_ascending_course_id() {
        // Two candidates with identical interaction patterns score equally.
        let rows = vec![
            agg(1, 10, 4.0),
            agg(2, 10, 1.0),
            agg(2, 12, 1.0),
            agg(2, 11, 1.0),
        ];
        let courses = vec![
            course(10, "cardiology", 2),
            course(11, "cardiology", 2),
            course(12, "cardiology", 2),
        ];

        let recs = Recommender::recommend(&rows, &courses, 1, 5, true);
        let history: Vec<i64> = recs
            .iter()
            .filter(|r| r.reason == RecommendReason::History)
            .map(|r| r.course_id)
            .collect();
        assert_eq!(history, vec![11, 12]);
    }

    #[test]
    fn underfill_tops_up_with_popular() {
        // User 1's history links only to course 11; ask for 3.
        let rows = vec![
            agg(1, 10, 5.0),
            agg(2, 10, 1.0),
            agg(2, 11, 1.0),
            agg(3, 12, 9.0),
            agg(4, 13, 7.0),
        ];
        // Difficulty gap of 3 zeroes the attribute similarity between the
        // user's course 10 and the unrelated 12/13, so only 11 scores.
        let courses = vec![
            course(10, "cardiology", 1),
            course(11, "cardiology", 1),
            course(12, "neurology", 4),
            course(13, "surgery", 4),
        ];

        let recs = Recommender::recommend(&rows, &courses, 1, 3, true);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].reason, RecommendReason::History);
        assert!(recs[1..].iter().all(|r| r.reason == RecommendReason::Popular));
        // Top-up never repeats the history pick or the user's own courses.
        let ids: HashSet<i64> = recs.iter().map(|r| r.course_id).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&10));
    }

    #[test]
    fn single_course_catalogue_falls_back_to_popular() {
        let rows = vec![agg(1, 10, 5.0), agg(2, 10, 2.0)];
        let courses = vec![course(10, "cardiology", 2)];

        // |C| < 2: popularity path, which may legitimately return the
        // user's own course (no exclusion on the pure popular path).
        let recs = Recommender::recommend(&rows, &courses, 1, 5, true);
        assert!(recs.iter().all(|r| r.reason == RecommendReason::Popular));
    }

    #[test]
    fn popular_excludes_requested_ids() {
        let rows = vec![agg(1, 10, 9.0), agg(2, 11, 5.0)];
        let courses = vec![course(10, "cardiology", 2), course(11, "neurology", 3)];

        let exclude: HashSet<i64> = [10].into_iter().collect();
        let recs = Recommender::popular(&rows, &courses, 5, &exclude);
        assert!(recs.iter().all(|r| r.course_id != 10));
        assert_eq!(recs[0].course_id, 11);
    }
}
