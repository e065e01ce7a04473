//! Custom operation parameters: schema checks and value resolution

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};

use crate::controller::error::{Error, Result};
use crate::crd::{CustomParameter, KeyRef, ParameterProperty, ParameterType, ParametersSchema};

fn check_type(name: &str, value: &str, prop: &ParameterProperty) -> Result<()> {
    let invalid = |kind: &str| {
        Error::ValidationError(format!(
            "parameter {} must be {}, got {:?}",
            name, kind, value
        ))
    };
    let number = match prop.type_ {
        ParameterType::String => None,
        ParameterType::Boolean => {
            value.parse::<bool>().map_err(|_| invalid("a boolean"))?;
            None
        }
        ParameterType::Integer => Some(
            value
                .parse::<i64>()
                .map_err(|_| invalid("an integer"))? as f64,
        ),
        ParameterType::Number => Some(value.parse::<f64>().map_err(|_| invalid("a number"))?),
    };
    if let Some(n) = number
        && (prop.minimum.is_some_and(|min| n < min) || prop.maximum.is_some_and(|max| n > max))
    {
        return Err(Error::ValidationError(format!(
            "parameter {} is out of range: {}",
            name, value
        )));
    }
    if !prop.enum_.is_empty() && !prop.enum_.iter().any(|e| e == value) {
        return Err(Error::ValidationError(format!(
            "parameter {} must be one of [{}]",
            name,
            prop.enum_.join(", ")
        )));
    }
    Ok(())
}

/// Check resolved values against the definition's schema
pub fn validate_parameters(
    schema: Option<&ParametersSchema>,
    values: &BTreeMap<String, String>,
) -> Result<()> {
    let Some(schema) = schema else {
        return Ok(());
    };
    for required in &schema.required {
        if !values.contains_key(required) {
            return Err(Error::ValidationError(format!(
                "parameter {} is required",
                required
            )));
        }
    }
    for (name, value) in values {
        let prop = schema.properties.get(name).ok_or_else(|| {
            Error::ValidationError(format!("parameter {} is not defined", name))
        })?;
        check_type(name, value, prop)?;
    }
    Ok(())
}

async fn config_map_value(client: &Client, namespace: &str, key_ref: &KeyRef) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    api.get_opt(&key_ref.name)
        .await?
        .and_then(|cm| cm.data)
        .and_then(|mut d| d.remove(&key_ref.key))
        .ok_or_else(|| {
            Error::fatal(format!(
                "key {} not found in ConfigMap {}",
                key_ref.key, key_ref.name
            ))
        })
}

async fn secret_value(client: &Client, namespace: &str, key_ref: &KeyRef) -> Result<String> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let bytes = api
        .get_opt(&key_ref.name)
        .await?
        .and_then(|s| s.data)
        .and_then(|mut d| d.remove(&key_ref.key))
        .ok_or_else(|| {
            Error::fatal(format!(
                "key {} not found in Secret {}",
                key_ref.key, key_ref.name
            ))
        })?;
    String::from_utf8(bytes.0)
        .map_err(|_| Error::fatal(format!("key {} of Secret {} is not utf-8", key_ref.key, key_ref.name)))
}

/// Resolve literal values and ConfigMap/Secret references
pub async fn resolve_parameters(
    client: &Client,
    namespace: &str,
    params: &[CustomParameter],
) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for p in params {
        let value = match (&p.value, &p.value_from) {
            (Some(v), _) => v.clone(),
            (None, Some(from)) => match (&from.config_map_key_ref, &from.secret_key_ref) {
                (Some(key_ref), _) => config_map_value(client, namespace, key_ref).await?,
                (None, Some(key_ref)) => secret_value(client, namespace, key_ref).await?,
                (None, None) => {
                    return Err(Error::ValidationError(format!(
                        "valueFrom of parameter {} names no source",
                        p.name
                    )));
                }
            },
            (None, None) => {
                return Err(Error::ValidationError(format!(
                    "parameter {} has no value",
                    p.name
                )));
            }
        };
        values.insert(p.name.clone(), value);
    }
    Ok(values)
}
