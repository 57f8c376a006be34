use crate::config::{ConfigError, SearchSettings};
use crate::models::OptimizationResult;
use crate::optimizer::{sort_results, OptimizationEngine};
use crate::param_utils::{format_parameters, parameter_signature, ParameterGrid};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet};

type Individual = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub generations: usize,
    pub mutation_rate: f64,
    pub elite_fraction: f64,
    pub tournament_size: usize,
    pub best_per_generation: usize,
    pub max_results: usize,
    pub seed: u64,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self::from_settings(&SearchSettings::default())
    }
}

impl GeneticConfig {
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self {
            population_size: settings.genetic_population,
            generations: settings.genetic_generations,
            mutation_rate: settings.genetic_mutation_rate,
            elite_fraction: 0.1,
            tournament_size: 3,
            best_per_generation: 5,
            max_results: 20,
            seed: settings.genetic_seed,
        }
    }

    pub fn elite_count(&self) -> usize {
        let elite = (self.population_size as f64 * self.elite_fraction).round() as usize;
        elite.max(1).min(self.population_size)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::InvalidSetting {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.population_size < 2 {
            return Err(invalid(
                "GENETIC_POPULATION",
                self.population_size.to_string(),
                "must be >= 2",
            ));
        }
        if self.generations == 0 {
            return Err(invalid("GENETIC_GENERATIONS", "0".to_string(), "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(invalid(
                "GENETIC_MUTATION_RATE",
                self.mutation_rate.to_string(),
                "must be in [0, 1]",
            ));
        }
        if self.tournament_size == 0 {
            return Err(invalid("tournament_size", "0".to_string(), "must be >= 1"));
        }
        Ok(())
    }
}

/// Evolves parameter sets drawn from per-parameter value lists.
pub struct GeneticOptimizer<'a> {
    engine: &'a OptimizationEngine,
    config: GeneticConfig,
}

impl<'a> GeneticOptimizer<'a> {
    pub fn new(engine: &'a OptimizationEngine, config: GeneticConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { engine, config })
    }

    /// Best distinct parameter sets seen across all generations, best first.
    pub fn run(&self, ranges: &ParameterGrid) -> Result<Vec<OptimizationResult>, ConfigError> {
        if ranges.is_empty() || ranges.values().any(|values| values.is_empty()) {
            return Err(ConfigError::EmptyGrid);
        }
        for (name, values) in ranges {
            for value in values {
                self.engine
                    .base_params()
                    .clone()
                    .with_override(name, *value)?
                    .validate()?;
            }
        }

        let status = self.engine.status();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut population: Vec<Individual> = (0..self.config.population_size)
            .map(|_| random_individual(ranges, &mut rng))
            .collect();
        let mut best_ever: Vec<OptimizationResult> = Vec::new();
        let mut best_signatures: HashSet<String> = HashSet::new();

        info!(
            "Starting genetic search: population {}, {} generations, seed {}",
            self.config.population_size, self.config.generations, self.config.seed
        );

        for generation in 0..self.config.generations {
            if status.is_cancelled() {
                warn!("Genetic search cancelled before generation {}", generation + 1);
                break;
            }
            status.set_phase(format!(
                "Genetic generation {}/{}",
                generation + 1,
                self.config.generations
            ));

            let evaluated = self.evaluate_population(&population);
            if let Some(best) = evaluated.first() {
                info!(
                    "Generation {}/{} best score {:.4} [{}]",
                    generation + 1,
                    self.config.generations,
                    best.score,
                    format_parameters(&best.parameters)
                );
            } else {
                warn!(
                    "Generation {}/{} produced no successful runs",
                    generation + 1,
                    self.config.generations
                );
            }

            let mut kept = 0;
            for result in &evaluated {
                if kept >= self.config.best_per_generation {
                    break;
                }
                kept += 1;
                if best_signatures.insert(parameter_signature(&result.parameters)) {
                    best_ever.push(result.clone());
                }
            }

            if generation + 1 < self.config.generations {
                population = self.next_generation(&evaluated, ranges, &mut rng);
            }
        }

        sort_results(&mut best_ever);
        best_ever.truncate(self.config.max_results);
        info!("Genetic search finished with {} results", best_ever.len());
        Ok(best_ever)
    }

    /// Scores each distinct individual once. The returned list is sorted best first.
    fn evaluate_population(&self, population: &[Individual]) -> Vec<OptimizationResult> {
        let mut seen = HashSet::new();
        let unique: Vec<Individual> = population
            .iter()
            .filter(|individual| seen.insert(parameter_signature(individual)))
            .cloned()
            .collect();

        let data = self.engine.data();
        let by_signature: HashMap<String, OptimizationResult> = self
            .engine
            .run_tasks(data, &unique, None)
            .into_iter()
            .filter_map(|task_result| task_result.result)
            .map(|result| (parameter_signature(&result.parameters), result))
            .collect();

        let mut evaluated: Vec<OptimizationResult> = population
            .iter()
            .filter_map(|individual| by_signature.get(&parameter_signature(individual)).cloned())
            .collect();
        sort_results(&mut evaluated);
        evaluated
    }

    fn next_generation(
        &self,
        evaluated: &[OptimizationResult],
        ranges: &ParameterGrid,
        rng: &mut StdRng,
    ) -> Vec<Individual> {
        let population_size = self.config.population_size;
        if evaluated.len() < 2 {
            let mut reseeded: Vec<Individual> =
                evaluated.iter().map(|r| r.parameters.clone()).collect();
            while reseeded.len() < population_size {
                reseeded.push(random_individual(ranges, rng));
            }
            return reseeded;
        }

        let elite_count = self.config.elite_count().min(evaluated.len());
        let mut next: Vec<Individual> = evaluated[..elite_count]
            .iter()
            .map(|result| result.parameters.clone())
            .collect();

        while next.len() < population_size {
            let parent1 = tournament_select(evaluated, self.config.tournament_size, rng);
            let parent2 = tournament_select(evaluated, self.config.tournament_size, rng);
            let mut child = crossover(parent1, parent2, rng);
            mutate(&mut child, ranges, self.config.mutation_rate, rng);
            next.push(child);
        }
        next
    }
}

fn random_individual(ranges: &ParameterGrid, rng: &mut StdRng) -> Individual {
    ranges
        .iter()
        .filter_map(|(name, values)| values.choose(rng).map(|value| (name.clone(), *value)))
        .collect()
}

/// Best of `size` distinct contestants drawn at random.
fn tournament_select<'r>(
    results: &'r [OptimizationResult],
    size: usize,
    rng: &mut StdRng,
) -> &'r Individual {
    let amount = size.min(results.len()).max(1);
    let winner = rand::seq::index::sample(rng, results.len(), amount)
        .into_iter()
        .map(|index| &results[index])
        .max_by(|a, b| a.score.total_cmp(&b.score));
    match winner {
        Some(result) => &result.parameters,
        None => &results[0].parameters,
    }
}

/// Keys before a random cut point come from `parent1`, the rest from `parent2`.
fn crossover(parent1: &Individual, parent2: &Individual, rng: &mut StdRng) -> Individual {
    let keys: Vec<&String> = parent1.keys().collect();
    if keys.len() < 2 {
        return if rng.gen_bool(0.5) {
            parent1.clone()
        } else {
            parent2.clone()
        };
    }

    let cut = rng.gen_range(1..keys.len());
    keys.iter()
        .enumerate()
        .map(|(index, key)| {
            let source = if index < cut { parent1 } else { parent2 };
            let value = source.get(*key).or_else(|| parent1.get(*key)).copied().unwrap_or(0.0);
            ((*key).clone(), value)
        })
        .collect()
}

fn mutate(individual: &mut Individual, ranges: &ParameterGrid, rate: f64, rng: &mut StdRng) {
    for (name, values) in ranges {
        if rng.gen::<f64>() < rate {
            if let Some(value) = values.choose(rng) {
                individual.insert(name.clone(), *value);
            }
        }
    }
}
