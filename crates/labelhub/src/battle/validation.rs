//! Checks a battle configuration against the dataset it will run on.

use std::collections::BTreeSet;

use crate::config::{AlBattleConfig, ConfigError};
use crate::dataset::Dataset;

/// Rejects configurations that could only fail later inside an experiment
/// process. Runs before a battle id is allocated.
pub fn validate_battle(config: &AlBattleConfig, dataset: &Dataset) -> Result<(), ConfigError> {
    config.validate()?;

    let classes = dataset.classes().len();
    for exp in &config.exp_configs {
        if let Some(required) = exp.query_strategy.required_classes()
            && required != classes
        {
            return Err(ConfigError::UnsupportedClassCount {
                strategy: exp.query_strategy.name(),
                required,
                actual: classes,
            });
        }
    }

    if let Some((x, y)) = &config.plot_config.features {
        let known: BTreeSet<&str> = dataset.feature_names.iter().map(String::as_str).collect();
        let unknown: Vec<String> = [x, y]
            .into_iter()
            .filter(|name| !known.contains(name.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::UnknownFeatures(unknown));
        }
    }

    let labeled = dataset.labeled().count();
    if labeled < 2 || classes < 2 {
        return Err(ConfigError::InsufficientLabels { labeled, classes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::dataset::fixtures;
    use crate::engine::{ModelKind, QueryStrategyConfig};

    fn bmdr_battle() -> AlBattleConfig {
        AlBattleConfig::new(
            ExperimentConfig::default(),
            ExperimentConfig {
                query_strategy: QueryStrategyConfig::Bmdr { beta: 1.0 },
                model: ModelKind::GaussianNaiveBayes,
            },
        )
    }

    #[test]
    fn binary_strategy_needs_two_classes() {
        let dataset = fixtures::clustered(1, 3, 4, true);
        assert_eq!(
            validate_battle(&bmdr_battle(), &dataset).unwrap_err(),
            ConfigError::UnsupportedClassCount {
                strategy: "bmdr",
                required: 2,
                actual: 3,
            }
        );

        let dataset = fixtures::clustered(1, 2, 4, true);
        assert!(validate_battle(&bmdr_battle(), &dataset).is_ok());
    }

    #[test]
    fn plot_features_must_exist() {
        let dataset = fixtures::clustered(1, 2, 4, true);
        let mut config = bmdr_battle();
        config.plot_config.features = Some(("width".to_string(), "depth".to_string()));

        assert_eq!(
            validate_battle(&config, &dataset).unwrap_err(),
            ConfigError::UnknownFeatures(vec!["depth".to_string()])
        );
    }

    #[test]
    fn needs_labels_from_two_classes() {
        let mut dataset = fixtures::clustered(1, 2, 4, false);
        dataset.samples[0].label = dataset.labels.first().copied();
        dataset.samples[1].label = dataset.labels.first().copied();

        let config = AlBattleConfig::new(ExperimentConfig::default(), ExperimentConfig::default());
        assert_eq!(
            validate_battle(&config, &dataset).unwrap_err(),
            ConfigError::InsufficientLabels {
                labeled: 2,
                classes: 1
            }
        );
    }

    #[test]
    fn static_checks_run_first() {
        let dataset = fixtures::clustered(1, 2, 4, true);
        let config = bmdr_battle().with_batch_size(0);
        assert!(matches!(
            validate_battle(&config, &dataset),
            Err(ConfigError::NonPositive {
                field: "batch_size"
            })
        ));
    }
}
