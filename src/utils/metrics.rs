use crate::algorithms::Scorer;
use crate::error::{RecError, Result};
use crate::models::InteractionMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_score: f64,
    pub ndcg_at_k: f64,
    pub auc: f64,
    /// Users with at least one held-out positive.
    pub users_evaluated: usize,
}

#[derive(Debug, Clone, Default)]
struct UserMetrics {
    precision: f64,
    recall: f64,
    ndcg: f64,
    auc: f64,
}

#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn calculate_precision_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if recommended.is_empty() || self.k == 0 {
            return 0.0;
        }

        let relevant_set: HashSet<_> = relevant.iter().collect();
        let relevant_recommended = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant_set.contains(item))
            .count();

        relevant_recommended as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let relevant_set: HashSet<_> = relevant.iter().collect();
        let relevant_recommended = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant_set.contains(item))
            .count();

        relevant_recommended as f64 / relevant.len() as f64
    }

    pub fn calculate_f1_score(&self, precision: f64, recall: f64) -> f64 {
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    /// Binary-relevance NDCG over the first `k` recommendations.
    pub fn calculate_ndcg_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        let relevant_set: HashSet<_> = relevant.iter().collect();
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item)| relevant_set.contains(item))
            .map(|(rank, _)| 1.0 / (rank as f64 + 2.0).log2())
            .sum();
        let idcg: f64 = (0..relevant.len().min(self.k))
            .map(|rank| 1.0 / (rank as f64 + 2.0).log2())
            .sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    /// Fraction of (relevant, irrelevant) pairs ordered correctly in a full
    /// ranking of the candidates.
    pub fn calculate_auc(&self, ranking: &[usize], relevant: &[usize]) -> f64 {
        let relevant_set: HashSet<_> = relevant.iter().collect();
        let n_relevant = ranking.iter().filter(|item| relevant_set.contains(item)).count();
        let n_irrelevant = ranking.len() - n_relevant;
        if n_relevant == 0 || n_irrelevant == 0 {
            return 0.5;
        }

        let mut irrelevant_seen = 0usize;
        let mut correct = 0usize;
        for item in ranking {
            if relevant_set.contains(item) {
                correct += n_irrelevant - irrelevant_seen;
            } else {
                irrelevant_seen += 1;
            }
        }
        correct as f64 / (n_relevant * n_irrelevant) as f64
    }

    /// Ranks every item not already positive in `train` for each user with
    /// held-out positives in `test`, and averages the per-user metrics.
    pub fn evaluate(
        &self,
        scorer: &Scorer<'_>,
        test: &InteractionMatrix,
        train: &InteractionMatrix,
    ) -> Result<RankingMetrics> {
        check_shapes(scorer, test, train)?;

        let per_user = (0..test.n_users())
            .into_par_iter()
            .filter_map(|user| {
                let relevant = test.positive_items(user);
                if relevant.is_empty() {
                    return None;
                }
                Some(self.evaluate_user(scorer, user, &relevant, &train.positive_items(user)))
            })
            .collect::<Result<Vec<UserMetrics>>>()?;

        if per_user.is_empty() {
            return Ok(RankingMetrics::default());
        }

        let n = per_user.len() as f64;
        let precision = per_user.iter().map(|m| m.precision).sum::<f64>() / n;
        let recall = per_user.iter().map(|m| m.recall).sum::<f64>() / n;
        Ok(RankingMetrics {
            precision_at_k: precision,
            recall_at_k: recall,
            f1_score: self.calculate_f1_score(precision, recall),
            ndcg_at_k: per_user.iter().map(|m| m.ndcg).sum::<f64>() / n,
            auc: per_user.iter().map(|m| m.auc).sum::<f64>() / n,
            users_evaluated: per_user.len(),
        })
    }

    fn evaluate_user(
        &self,
        scorer: &Scorer<'_>,
        user: usize,
        relevant: &[usize],
        known: &[usize],
    ) -> Result<UserMetrics> {
        let ranking: Vec<usize> = scorer
            .top_k(user, scorer.n_items(), known)?
            .into_iter()
            .map(|(item, _)| item)
            .collect();

        Ok(UserMetrics {
            precision: self.calculate_precision_at_k(&ranking, relevant),
            recall: self.calculate_recall_at_k(&ranking, relevant),
            ndcg: self.calculate_ndcg_at_k(&ranking, relevant),
            auc: self.calculate_auc(&ranking, relevant),
        })
    }

    /// Precision@k a uniformly random ranking would reach on average.
    pub fn expected_random_precision(
        &self,
        test: &InteractionMatrix,
        train: &InteractionMatrix,
    ) -> f64 {
        let mut total = 0.0;
        let mut users = 0usize;
        for user in 0..test.n_users() {
            let relevant = test.positive_items(user).len();
            if relevant == 0 {
                continue;
            }
            let candidates = test.n_items() - train.positive_items(user).len();
            if candidates > 0 {
                total += relevant as f64 / candidates as f64;
            }
            users += 1;
        }

        if users == 0 {
            0.0
        } else {
            total / users as f64
        }
    }
}

fn check_shapes(scorer: &Scorer<'_>, test: &InteractionMatrix, train: &InteractionMatrix) -> Result<()> {
    for matrix in [test, train] {
        if matrix.n_users() != scorer.n_users() || matrix.n_items() != scorer.n_items() {
            return Err(RecError::dimension(format!(
                "evaluation matrix is {} x {}, model covers {} x {}",
                matrix.n_users(),
                matrix.n_items(),
                scorer.n_users(),
                scorer.n_items()
            )));
        }
    }
    Ok(())
}
