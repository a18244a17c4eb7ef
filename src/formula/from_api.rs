//! Build a [`FormulaClass`] from a JSON API record.
//!
//! The record is first overlaid with its variation for the build platform,
//! then validated through the typed schema below. Every field is defaulted
//! explicitly; a record missing both a stable and a head URL is rejected.

use super::{
    BottleFile, BottleSpec, BuildContext, Conflict, Dependency, DependencyKind, FormulaClass,
    KegOnlyReason, Lifecycle, Requirement, Resource, SoftwareSpec, UsesFromMacos, class_s,
    effective_dependencies,
};
use crate::api::merge_variations;
use crate::error::{BruError, Result};
use crate::platform::macos_name_for_number;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Requirements that survive the trip through the API.
const API_SUPPORTED_REQUIREMENTS: [&str; 5] = ["arch", "linux", "macos", "maximum_macos", "xcode"];

const RAW_CORE_SOURCE: &str = "https://raw.githubusercontent.com/Homebrew/homebrew-core";

#[derive(Debug, Deserialize)]
struct FormulaRecord {
    /// Absent when the record came out of an index keyed by name.
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    license: Option<Value>,
    #[serde(default)]
    versions: Versions,
    #[serde(default)]
    urls: Urls,
    #[serde(default)]
    revision: u32,
    #[serde(default)]
    version_scheme: u32,
    #[serde(default)]
    bottle: BottleRecord,
    #[serde(default)]
    keg_only_reason: Option<KegOnlyRecord>,
    #[serde(flatten)]
    dependencies: DependencyLists,
    #[serde(default)]
    head_dependencies: Option<DependencyLists>,
    #[serde(default)]
    requirements: Vec<RequirementRecord>,
    #[serde(default)]
    conflicts_with: Vec<String>,
    #[serde(default)]
    conflicts_with_reasons: Vec<Option<String>>,
    #[serde(default)]
    link_overwrite: Vec<String>,
    #[serde(default)]
    caveats: Option<String>,
    #[serde(default)]
    deprecation_date: Option<String>,
    #[serde(default)]
    deprecation_reason: Option<String>,
    #[serde(default)]
    disable_date: Option<String>,
    #[serde(default)]
    disable_reason: Option<String>,
    #[serde(default)]
    service: Option<Value>,
    #[serde(default)]
    tap_git_head: Option<String>,
    #[serde(default)]
    ruby_source_path: Option<String>,
    #[serde(default)]
    ruby_source_checksum: Option<Checksum>,
    #[serde(default)]
    oldname: Option<String>,
    #[serde(default)]
    oldnames: Option<Vec<String>>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    versioned_formulae: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Versions {
    #[serde(default)]
    stable: Option<String>,
    #[serde(default)]
    head: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Urls {
    #[serde(default)]
    stable: Option<UrlRecord>,
    #[serde(default)]
    head: Option<UrlRecord>,
}

#[derive(Debug, Deserialize)]
struct UrlRecord {
    url: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    using: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BottleRecord {
    #[serde(default)]
    stable: Option<BottleStable>,
}

#[derive(Debug, Deserialize)]
struct BottleStable {
    #[serde(default)]
    rebuild: u32,
    #[serde(default)]
    files: BTreeMap<String, BottleFileRecord>,
}

#[derive(Debug, Deserialize)]
struct BottleFileRecord {
    cellar: String,
    sha256: String,
}

#[derive(Debug, Deserialize)]
struct KegOnlyRecord {
    reason: String,
    #[serde(default)]
    explanation: String,
}

#[derive(Debug, Default, Deserialize)]
struct DependencyLists {
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    build_dependencies: Vec<String>,
    #[serde(default)]
    test_dependencies: Vec<String>,
    #[serde(default)]
    recommended_dependencies: Vec<String>,
    #[serde(default)]
    optional_dependencies: Vec<String>,
    /// Either `"name"` or `{"name": "build"}`.
    #[serde(default)]
    uses_from_macos: Vec<Value>,
    /// Parallel to `uses_from_macos`; absent in older records.
    #[serde(default)]
    uses_from_macos_bounds: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RequirementRecord {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    contexts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Checksum {
    sha256: String,
}

/// Compile `record` for the formula `name`.
pub fn build(name: &str, record: &Value, context: &BuildContext) -> Result<FormulaClass> {
    let merged = merge_variations(record, &context.platform);
    let record: FormulaRecord =
        serde_json::from_value(merged).map_err(|e| BruError::InvalidApiRecord {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    if record.urls.stable.is_none() && record.urls.head.is_none() {
        return Err(BruError::InvalidApiRecord {
            name: name.to_string(),
            reason: "record has neither a stable nor a head URL".to_string(),
        });
    }

    let (stable_declared, uses_from_macos) = dependencies(&record.dependencies, context);
    let stable = record.urls.stable.as_ref().map(|url| SoftwareSpec {
        url: url.url.clone(),
        tag: url.tag.clone(),
        revision: url.revision.clone(),
        branch: url.branch.clone(),
        using: url.using.clone(),
        version: record.versions.stable.clone(),
        checksum: url.checksum.clone(),
        dependencies: effective_dependencies(&stable_declared, &uses_from_macos, &context.platform),
    });

    let head = record.urls.head.as_ref().map(|url| {
        let (declared, uses) = match &record.head_dependencies {
            Some(lists) => dependencies(lists, context),
            None => (stable_declared.clone(), uses_from_macos.clone()),
        };
        SoftwareSpec {
            url: url.url.clone(),
            branch: url.branch.clone(),
            using: url.using.clone(),
            version: Some(record.versions.head.clone().unwrap_or_else(|| "HEAD".to_string())),
            dependencies: effective_dependencies(&declared, &uses, &context.platform),
            ..SoftwareSpec::default()
        }
    });

    let bottle = record.bottle.stable.as_ref().map(|bottle| BottleSpec {
        root_url: context.bottle_domain.clone(),
        rebuild: bottle.rebuild,
        files: bottle
            .files
            .iter()
            .map(|(tag, file)| {
                (
                    tag.clone(),
                    BottleFile {
                        cellar: file.cellar.clone(),
                        sha256: file.sha256.clone(),
                    },
                )
            })
            .collect(),
    });

    let keg_only = record.keg_only_reason.as_ref().map(|keg_only| KegOnlyReason {
        reason: symbol_name(&keg_only.reason),
        explanation: keg_only.explanation.clone(),
    });

    let lifecycle = |date: &Option<String>, reason: &Option<String>| {
        date.as_ref().map(|date| Lifecycle {
            date: date.clone(),
            because: reason.as_deref().map(symbol_name),
        })
    };

    let requirements = record
        .requirements
        .iter()
        .filter(|req| API_SUPPORTED_REQUIREMENTS.contains(&req.name.as_str()))
        .map(|req| {
            let version = match req.name.as_str() {
                "macos" | "maximum_macos" => req.version.as_deref().map(|number| {
                    macos_name_for_number(number)
                        .map(str::to_string)
                        .unwrap_or_else(|| number.to_string())
                }),
                _ => req.version.clone(),
            };
            Requirement {
                name: req.name.clone(),
                version,
                contexts: req
                    .contexts
                    .iter()
                    .filter_map(|context| context.as_str().map(str::to_string))
                    .collect(),
            }
        })
        .collect();

    let conflicts = record
        .conflicts_with
        .iter()
        .enumerate()
        .map(|(index, conflict)| Conflict {
            name: conflict.clone(),
            because: record.conflicts_with_reasons.get(index).cloned().flatten(),
        })
        .collect();

    let resources = match &record.ruby_source_checksum {
        Some(checksum) => {
            let git_head = record.tap_git_head.as_deref().unwrap_or("HEAD");
            let path = record
                .ruby_source_path
                .clone()
                .unwrap_or_else(|| format!("Formula/{}.rb", name));
            vec![Resource {
                name: "ruby-source".to_string(),
                url: format!("{}/{}/{}", RAW_CORE_SOURCE, git_head, path),
                sha256: Some(checksum.sha256.clone()),
            }]
        }
        None => Vec::new(),
    };

    let prefix = context.prefix.display().to_string();
    let caveats = record
        .caveats
        .as_ref()
        .map(|caveats| caveats.replace("$HOMEBREW_PREFIX", &prefix));

    let oldnames = match record.oldnames {
        Some(oldnames) => oldnames,
        None => record.oldname.into_iter().collect(),
    };

    let name = record.name.unwrap_or_else(|| name.to_string());
    Ok(FormulaClass {
        class_name: class_s(&name),
        name,
        desc: record.desc,
        homepage: record.homepage,
        license: record.license.as_ref().and_then(license_expression),
        revision: record.revision,
        version_scheme: record.version_scheme,
        stable,
        head,
        bottle,
        keg_only,
        deprecation: lifecycle(&record.deprecation_date, &record.deprecation_reason),
        disable: lifecycle(&record.disable_date, &record.disable_reason),
        uses_from_macos,
        requirements,
        conflicts,
        link_overwrite: record.link_overwrite,
        resources,
        caveats,
        service: record.service,
        tap_git_head: record.tap_git_head,
        oldnames,
        aliases: record.aliases,
        versioned_formulae: record.versioned_formulae,
        loaded_from_api: true,
    })
}

/// Declared dependencies and `uses_from_macos` entries from one dependency set.
fn dependencies(lists: &DependencyLists, context: &BuildContext) -> (Vec<Dependency>, Vec<UsesFromMacos>) {
    let uses_from_macos: Vec<UsesFromMacos> = lists
        .uses_from_macos
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let since = lists
                .uses_from_macos_bounds
                .as_ref()
                .and_then(|bounds| bounds.get(index))
                .and_then(|bound| bound.get("since"))
                .and_then(Value::as_str)
                .map(symbol_name);
            uses_from_macos_entry(entry, since)
        })
        .collect();

    // Older records listed `uses_from_macos` names among the runtime
    // dependencies on Linux. Without bounds, drop them unless on macOS.
    let legacy = lists.uses_from_macos_bounds.is_none() && !context.platform.is_macos();
    let mut declared: Vec<Dependency> = lists
        .dependencies
        .iter()
        .filter(|name| !(legacy && uses_from_macos.iter().any(|u| &&u.name == name)))
        .map(|name| Dependency::new(name, DependencyKind::Runtime))
        .collect();

    for (names, kind) in [
        (&lists.build_dependencies, DependencyKind::Build),
        (&lists.test_dependencies, DependencyKind::Test),
        (&lists.recommended_dependencies, DependencyKind::Recommended),
        (&lists.optional_dependencies, DependencyKind::Optional),
    ] {
        declared.extend(names.iter().map(|name| Dependency::new(name, kind)));
    }

    (declared, uses_from_macos)
}

fn uses_from_macos_entry(entry: &Value, since: Option<String>) -> Option<UsesFromMacos> {
    match entry {
        Value::String(name) => Some(UsesFromMacos {
            name: name.clone(),
            kind: DependencyKind::Runtime,
            since,
        }),
        Value::Object(map) => {
            let (name, tag) = map.iter().next()?;
            let kind = tag
                .as_str()
                .and_then(DependencyKind::from_tag)
                .or_else(|| {
                    tag.as_array()
                        .and_then(|tags| tags.first())
                        .and_then(Value::as_str)
                        .and_then(DependencyKind::from_tag)
                })
                .unwrap_or(DependencyKind::Runtime);
            Some(UsesFromMacos {
                name: name.clone(),
                kind,
                since,
            })
        }
        _ => None,
    }
}

/// SPDX expression from either a plain string or an `any_of`/`all_of` tree.
fn license_expression(license: &Value) -> Option<String> {
    match license {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let (op, items) = map.iter().next()?;
            let joiner = match op.as_str() {
                "any_of" => " or ",
                "all_of" => " and ",
                _ => return Some(op.clone()),
            };
            let parts: Vec<String> = items
                .as_array()?
                .iter()
                .filter_map(license_expression)
                .collect();
            Some(format!("({})", parts.join(joiner)))
        }
        _ => None,
    }
}

fn symbol_name(value: &str) -> String {
    value.strip_prefix(':').unwrap_or(value).to_string()
}
