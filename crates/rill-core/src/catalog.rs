//! Model catalog aggregation.
//!
//! Each provider is queried on its own task with its own deadline, so
//! one slow or broken provider never hides the others. Failures become
//! rows instead of errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::providers::{Model, Provider, ProviderError, ProviderResult};

/// Per-provider deadline for a catalog fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One displayable line of the aggregated catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub provider: String,
    pub model: Option<Model>,
    /// Present for error and no-match rows.
    pub note: Option<String>,
}

impl CatalogRow {
    pub fn model(provider: &str, model: Model) -> Self {
        Self {
            provider: provider.to_string(),
            model: Some(model),
            note: None,
        }
    }

    pub fn error(provider: &str, error: &ProviderError) -> Self {
        Self {
            provider: provider.to_string(),
            model: None,
            note: Some(format!("error: {error}")),
        }
    }

    pub fn no_match(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: None,
            note: Some("no models match the whitelist".to_string()),
        }
    }

    /// Rows without a model cannot be selected.
    pub fn selectable(&self) -> bool {
        self.model.is_some()
    }

    pub fn display(&self) -> String {
        match (&self.model, &self.note) {
            (Some(model), _) => {
                let mut line = format!("{} \u{25b8} {}", self.provider, model.name);
                if !model.description.is_empty() {
                    line.push_str("  ");
                    line.push_str(&model.description);
                }
                if !model.capabilities.is_empty() {
                    line.push_str(&format!(" [{}]", model.capabilities.join(", ")));
                }
                line
            }
            (None, Some(note)) => format!("{} \u{25b8} {note}", self.provider),
            (None, None) => self.provider.clone(),
        }
    }
}

/// Result of one provider's fetch, already whitelist-filtered.
#[derive(Debug, Clone)]
pub struct CatalogResult {
    pub provider: String,
    pub outcome: ProviderResult<Vec<Model>>,
}

impl CatalogResult {
    /// Rows this result contributes to the catalog view.
    pub fn rows(&self) -> Vec<CatalogRow> {
        match &self.outcome {
            Ok(models) if models.is_empty() => vec![CatalogRow::no_match(&self.provider)],
            Ok(models) => models
                .iter()
                .map(|model| CatalogRow::model(&self.provider, model.clone()))
                .collect(),
            Err(error) => vec![CatalogRow::error(&self.provider, error)],
        }
    }
}

/// Keep only whitelisted models. An empty whitelist keeps everything.
pub fn filter_models(models: Vec<Model>, whitelist: &HashSet<String>) -> Vec<Model> {
    if whitelist.is_empty() {
        return models;
    }
    models
        .into_iter()
        .filter(|model| whitelist.contains(&model.name))
        .collect()
}

/// Fetch one provider's catalog on its own task. `emit` fires exactly
/// once, with the filtered result, unless `cancel` fires first.
pub fn spawn_fetch<F>(
    provider: Arc<dyn Provider>,
    whitelist: HashSet<String>,
    cancel: CancellationToken,
    emit: F,
) where
    F: FnOnce(CatalogResult) + Send + 'static,
{
    tokio::spawn(async move {
        let name = provider.name().to_string();
        let fetched = tokio::select! {
            fetched = tokio::time::timeout(FETCH_TIMEOUT, provider.list_models()) => fetched,
            () = cancel.cancelled() => return,
        };
        let outcome = match fetched {
            Ok(Ok(models)) => Ok(filter_models(models, &whitelist)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ProviderError::timeout(FETCH_TIMEOUT.as_secs())),
        };
        if let Err(error) = &outcome {
            tracing::warn!(provider = %name, %error, "catalog fetch failed");
        }
        emit(CatalogResult {
            provider: name,
            outcome,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderErrorKind;

    fn named(name: &str) -> Model {
        Model {
            name: name.to_string(),
            ..Model::default()
        }
    }

    #[test]
    fn empty_whitelist_keeps_everything() {
        let models = vec![named("a"), named("b")];
        assert_eq!(filter_models(models.clone(), &HashSet::new()), models);
    }

    #[test]
    fn whitelist_filters_by_exact_name() {
        let whitelist: HashSet<String> = ["b".to_string()].into();
        let kept = filter_models(vec![named("a"), named("b")], &whitelist);
        assert_eq!(kept, vec![named("b")]);
    }

    #[test]
    fn empty_result_becomes_a_no_match_row() {
        let result = CatalogResult {
            provider: "p1".to_string(),
            outcome: Ok(vec![]),
        };
        let rows = result.rows();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].selectable());
        assert!(rows[0].display().contains("no models match"));
    }

    #[test]
    fn error_result_becomes_an_error_row() {
        let result = CatalogResult {
            provider: "p2".to_string(),
            outcome: Err(ProviderError::new(ProviderErrorKind::Timeout, "timed out after 10s")),
        };
        let rows = result.rows();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].selectable());
        assert!(rows[0].display().contains("timed out"));
    }

    #[test]
    fn model_rows_are_selectable() {
        let result = CatalogResult {
            provider: "p1".to_string(),
            outcome: Ok(vec![named("m1"), named("m2")]),
        };
        let rows = result.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(CatalogRow::selectable));
    }
}
