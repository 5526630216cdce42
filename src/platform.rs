use crate::config::{LauncherRegistry, PlatformDefinition};
use crate::error::LauncherError;
use std::collections::btree_map;
use tracing::{debug, info};

/// Resolves a platform key or alias to an enabled, credentialed definition.
///
/// An empty token selects `default_platform`, or failing that the first
/// enabled platform with a credential. A token that is both an alias and a
/// key is read as the alias.
pub fn resolve<'a>(
    name_or_alias: &str,
    registry: &'a LauncherRegistry,
) -> Result<&'a PlatformDefinition, LauncherError> {
    let token = name_or_alias.trim();
    let key = if token.is_empty() {
        default_key(registry)?
    } else {
        lookup(token, registry).ok_or_else(|| LauncherError::UnknownPlatform {
            key: token.to_string(),
        })?
    };

    let platform = registry
        .platforms
        .get(key)
        .ok_or_else(|| LauncherError::UnknownPlatform {
            key: key.to_string(),
        })?;
    if !platform.enabled {
        return Err(LauncherError::PlatformDisabled {
            key: key.to_string(),
        });
    }
    if !platform.has_credential() {
        return Err(LauncherError::config_invalid(
            &registry.source,
            format!(
                "platforms.{key}.{} is empty; add the credential to use this platform",
                platform.credential.field_name()
            ),
        ));
    }
    info!(platform = %key, name = %platform.name, "platform selected");
    Ok(platform)
}

fn lookup<'a>(token: &str, registry: &'a LauncherRegistry) -> Option<&'a str> {
    let lowered = token.to_ascii_lowercase();
    for candidate in [token, lowered.as_str()] {
        if let Some(target) = registry.aliases.get(candidate) {
            debug!(alias = %candidate, platform = %target, "alias resolved");
            return Some(target.as_str());
        }
        if let Some((key, _)) = registry.platforms.get_key_value(candidate) {
            return Some(key.as_str());
        }
    }
    None
}

fn default_key(registry: &LauncherRegistry) -> Result<&str, LauncherError> {
    if let Some(default) = registry.default_platform.as_deref() {
        // Load-time validation guarantees a key, so aliases are not consulted.
        return registry
            .platforms
            .get_key_value(default)
            .map(|(key, _)| key.as_str())
            .ok_or_else(|| LauncherError::UnknownPlatform {
                key: default.to_string(),
            });
    }
    registry
        .platforms
        .iter()
        .find(|(_, p)| p.enabled && p.has_credential())
        .map(|(key, _)| {
            debug!(platform = %key, "no default_platform; using first available platform");
            key.as_str()
        })
        .ok_or_else(|| {
            LauncherError::config_invalid(
                &registry.source,
                "no platform was requested, default_platform is unset and no enabled platform has a credential",
            )
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEntry<'a> {
    pub key: &'a str,
    pub definition: &'a PlatformDefinition,
    pub enabled: bool,
    pub has_credential: bool,
    pub aliases: Vec<&'a str>,
}

/// Lazy walk over every platform in key order. Clone it to restart.
#[derive(Debug, Clone)]
pub struct PlatformListing<'a> {
    registry: &'a LauncherRegistry,
    inner: btree_map::Iter<'a, String, PlatformDefinition>,
}

impl<'a> Iterator for PlatformListing<'a> {
    type Item = PlatformEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, definition) = self.inner.next()?;
        let aliases = self
            .registry
            .aliases
            .iter()
            .filter(|(_, target)| *target == key)
            .map(|(alias, _)| alias.as_str())
            .collect();
        Some(PlatformEntry {
            key,
            definition,
            enabled: definition.enabled,
            has_credential: definition.has_credential(),
            aliases,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub fn list(registry: &LauncherRegistry) -> PlatformListing<'_> {
    PlatformListing {
        registry,
        inner: registry.platforms.iter(),
    }
}
