//! Build a [`FormulaClass`] from definition source text.

use super::{
    BuildContext, Conflict, Dependency, DependencyKind, FormulaClass, KegOnlyReason, Lifecycle,
    Requirement, SoftwareSpec, UsesFromMacos, class_s, effective_dependencies, interpolate_version,
};
use crate::dsl::{Call, Document, Literal, Statement, StatementKind, active_statements};
use crate::error::{BruError, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::OnceLock;

/// Requirement names `depends_on` accepts as symbols or keywords.
const REQUIREMENT_NAMES: [&str; 5] = ["arch", "linux", "macos", "maximum_macos", "xcode"];

/// Compile the definition of `name` read from `path`.
pub fn compile(name: &str, path: &Path, contents: &str, context: &BuildContext) -> Result<FormulaClass> {
    let document = Document::parse(contents).map_err(|e| BruError::FormulaUnreadable {
        name: name.to_string(),
        reason: format!("{}:{}: {}", path.display(), e.line, e.message),
    })?;

    let class_name = class_s(name);
    let Some(body) = document.class_body(&class_name) else {
        return Err(BruError::FormulaClassUnavailable {
            name: name.to_string(),
            path: path.to_path_buf(),
            class_name,
            class_list: formula_classes(&document),
        });
    };

    let mut builder = Builder::new(name, class_name, context);
    builder.apply(body, Target::Common);
    tracing::debug!("compiled {} from {}", name, path.display());
    Ok(builder.finish())
}

/// Classes that look like package definitions.
fn formula_classes(document: &Document) -> Vec<String> {
    document
        .statements
        .iter()
        .filter_map(|stmt| match &stmt.kind {
            StatementKind::Class {
                name,
                superclass: Some(superclass),
                ..
            } if superclass.contains("Formula") => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Common,
    Stable,
    Head,
}

#[derive(Default)]
struct SpecParts {
    url: Option<Call>,
    version: Option<String>,
    checksum: Option<String>,
    dependencies: Vec<Dependency>,
    uses_from_macos: Vec<UsesFromMacos>,
}

struct Builder<'a> {
    context: &'a BuildContext,
    class: FormulaClass,
    common: SpecParts,
    stable: SpecParts,
    head: SpecParts,
    has_stable_block: bool,
    has_head: bool,
}

impl<'a> Builder<'a> {
    fn new(name: &str, class_name: String, context: &'a BuildContext) -> Self {
        Self {
            context,
            class: FormulaClass {
                class_name,
                name: name.to_string(),
                ..FormulaClass::default()
            },
            common: SpecParts::default(),
            stable: SpecParts::default(),
            head: SpecParts::default(),
            has_stable_block: false,
            has_head: false,
        }
    }

    fn parts(&mut self, target: Target) -> &mut SpecParts {
        match target {
            Target::Common => &mut self.common,
            Target::Stable => &mut self.stable,
            Target::Head => &mut self.head,
        }
    }

    fn apply(&mut self, body: &[Statement], target: Target) {
        let platform = self.context.platform;
        for stmt in active_statements(body, &platform) {
            match &stmt.kind {
                StatementKind::Call(call) if call.receiver.is_none() => self.call(call, target),
                StatementKind::Def { name, body } if name == "caveats" => {
                    self.class.caveats = caveats_text(body);
                }
                _ => {}
            }
        }
    }

    fn call(&mut self, call: &Call, target: Target) {
        let first_str = || call.arg(0).and_then(Literal::as_str).map(str::to_string);

        match call.method.as_str() {
            "desc" => self.class.desc = first_str(),
            "homepage" => self.class.homepage = first_str(),
            "license" => self.class.license = license(call),
            "revision" => {
                self.class.revision = call
                    .arg(0)
                    .and_then(Literal::as_int)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0)
            }
            "version_scheme" => {
                self.class.version_scheme = call
                    .arg(0)
                    .and_then(Literal::as_int)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0)
            }
            "url" => {
                let target = if target == Target::Common { Target::Stable } else { target };
                self.parts(target).url = Some(call.clone());
            }
            "version" => {
                let target = if target == Target::Common { Target::Stable } else { target };
                self.parts(target).version = first_str();
            }
            "sha256" => {
                let target = if target == Target::Common { Target::Stable } else { target };
                self.parts(target).checksum = first_str();
            }
            "stable" if call.block.is_some() => {
                self.has_stable_block = true;
                if let Some(block) = &call.block {
                    self.apply(block, Target::Stable);
                }
            }
            "head" => {
                self.has_head = true;
                if call.arg(0).is_some() {
                    self.head.url = Some(call.clone());
                }
                if let Some(block) = &call.block {
                    self.apply(block, Target::Head);
                }
            }
            "keg_only" => {
                let (reason, explanation) = match call.arg(0) {
                    Some(Literal::Sym(reason)) => (
                        reason.clone(),
                        call.arg(1).and_then(Literal::as_str).unwrap_or("").to_string(),
                    ),
                    Some(Literal::Str(explanation)) => (explanation.clone(), explanation.clone()),
                    _ => return,
                };
                self.class.keg_only = Some(KegOnlyReason {
                    reason,
                    explanation,
                });
            }
            "depends_on" => self.depends_on(call, target),
            "uses_from_macos" => {
                let since = call.kwarg("since").and_then(Literal::as_text).map(str::to_string);
                for (name, kind) in named_with_kind(call) {
                    self.parts(target).uses_from_macos.push(UsesFromMacos {
                        name,
                        kind,
                        since: since.clone(),
                    });
                }
            }
            "conflicts_with" => {
                let because = call.kwarg("because").and_then(Literal::as_str).map(str::to_string);
                for name in call.strings() {
                    self.class.conflicts.push(Conflict {
                        name: name.to_string(),
                        because: because.clone(),
                    });
                }
            }
            "deprecate!" => self.class.deprecation = lifecycle(call),
            "disable!" => self.class.disable = lifecycle(call),
            "link_overwrite" => {
                for arg in &call.args {
                    self.class
                        .link_overwrite
                        .extend(arg.as_list().into_iter().filter_map(Literal::as_str).map(str::to_string));
                }
            }
            "caveats" => self.class.caveats = first_str(),
            "service" if call.block.is_some() => {
                self.class.service = Some(Value::Object(Map::new()));
            }
            "mirror" | "bottle" | "test" | "resource" | "patch" | "livecheck" | "pour_bottle?"
            | "option" | "fails_with" | "cxxstdlib_check" | "skip_clean" | "pypi_packages"
            | "no_autobump!" | "compatibility_version" | "include" => {}
            other => tracing::trace!("{}: ignoring `{}`", self.class.name, other),
        }
    }

    fn depends_on(&mut self, call: &Call, target: Target) {
        for (key, value) in &call.kwargs {
            if REQUIREMENT_NAMES.contains(&key.as_str()) {
                self.class.requirements.push(requirement(key, Some(value)));
            }
        }

        for arg in &call.args {
            match arg {
                Literal::Str(name) => self
                    .parts(target)
                    .dependencies
                    .push(Dependency::new(name, DependencyKind::Runtime)),
                Literal::Sym(req) if REQUIREMENT_NAMES.contains(&req.as_str()) => {
                    self.class.requirements.push(requirement(req, None));
                }
                Literal::Hash(entries) => {
                    for (key, value) in entries {
                        match key {
                            Literal::Str(name) => {
                                let kind = dependency_kind(value);
                                self.parts(target).dependencies.push(Dependency::new(name, kind));
                            }
                            Literal::Sym(req) if REQUIREMENT_NAMES.contains(&req.as_str()) => {
                                self.class.requirements.push(requirement(req, None));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn finish(mut self) -> FormulaClass {
        let platform = self.context.platform;
        let common = std::mem::take(&mut self.common);

        let build_spec = |parts: &SpecParts, head: bool| -> Option<SoftwareSpec> {
            let url_call = parts.url.as_ref()?;
            let raw_url = url_call.arg(0).and_then(Literal::as_str)?;
            let kwarg = |key: &str| url_call.kwarg(key).and_then(Literal::as_text).map(str::to_string);

            let tag = kwarg("tag");
            let version = if head {
                Some("HEAD".to_string())
            } else {
                parts
                    .version
                    .clone()
                    .or_else(|| common.version.clone())
                    .or_else(|| tag.as_deref().and_then(version_from_tag))
                    .or_else(|| version_from_url(raw_url))
            };

            let mut declared = common.dependencies.clone();
            declared.extend(parts.dependencies.iter().cloned());
            let mut uses = common.uses_from_macos.clone();
            uses.extend(parts.uses_from_macos.iter().cloned());

            Some(SoftwareSpec {
                url: interpolate_version(raw_url, version.as_deref()),
                tag,
                revision: kwarg("revision"),
                branch: kwarg("branch"),
                using: kwarg("using"),
                checksum: parts.checksum.clone().or_else(|| common.checksum.clone()),
                dependencies: effective_dependencies(&declared, &uses, &platform),
                version,
            })
        };

        self.class.stable = build_spec(&self.stable, false);
        if self.has_head {
            self.class.head = build_spec(&self.head, true);
        }

        let mut uses = common.uses_from_macos.clone();
        uses.extend(self.stable.uses_from_macos.iter().cloned());
        self.class.uses_from_macos = uses;
        self.class
    }
}

fn caveats_text(body: &[Statement]) -> Option<String> {
    body.iter().rev().find_map(|stmt| match &stmt.kind {
        StatementKind::Literal(Literal::Str(text)) => Some(text.clone()),
        _ => None,
    })
}

fn license(call: &Call) -> Option<String> {
    if let Some(text) = call.arg(0).and_then(Literal::as_text) {
        return Some(text.to_string());
    }
    for (op, joiner) in [("any_of", " or "), ("all_of", " and ")] {
        if let Some(items) = call.kwarg(op) {
            let parts: Vec<&str> = items.as_list().into_iter().filter_map(Literal::as_text).collect();
            return Some(format!("({})", parts.join(joiner)));
        }
    }
    None
}

fn lifecycle(call: &Call) -> Option<Lifecycle> {
    let date = call.kwarg("date").and_then(Literal::as_str)?.to_string();
    let because = call.kwarg("because").and_then(Literal::as_text).map(str::to_string);
    Some(Lifecycle { date, because })
}

fn requirement(name: &str, value: Option<&Literal>) -> Requirement {
    let (version, contexts) = match value {
        Some(Literal::Sym(version)) | Some(Literal::Str(version)) => (Some(version.clone()), vec![]),
        Some(Literal::Array(items)) => {
            let version = items.first().and_then(Literal::as_text).map(str::to_string);
            let contexts = items
                .iter()
                .skip(1)
                .filter_map(Literal::as_sym)
                .map(str::to_string)
                .collect();
            (version, contexts)
        }
        _ => (None, vec![]),
    };
    Requirement {
        name: name.to_string(),
        version,
        contexts,
    }
}

/// `"a"`, `"a" => :build` or `"a" => [:build, :test]`.
fn named_with_kind(call: &Call) -> Vec<(String, DependencyKind)> {
    let mut named = Vec::new();
    for arg in &call.args {
        match arg {
            Literal::Str(name) => named.push((name.clone(), DependencyKind::Runtime)),
            Literal::Hash(entries) => {
                for (key, value) in entries {
                    if let Some(name) = key.as_str() {
                        named.push((name.to_string(), dependency_kind(value)));
                    }
                }
            }
            _ => {}
        }
    }
    named
}

fn dependency_kind(value: &Literal) -> DependencyKind {
    value
        .as_list()
        .into_iter()
        .filter_map(Literal::as_sym)
        .find_map(DependencyKind::from_tag)
        .unwrap_or(DependencyKind::Runtime)
}

fn version_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| {
            Regex::new(r"(?:^|[-_/])v?(\d+(?:[._]\d+)*(?:[-.]?(?:alpha|beta|rc|pre|p)\d*)?[a-z]?)$").ok()
        })
        .as_ref()
}

const ARCHIVE_EXTENSIONS: [&str; 12] = [
    ".tar.gz", ".tar.bz2", ".tar.xz", ".tar.zst", ".tar.lz", ".tgz", ".tbz", ".txz", ".zip",
    ".tar", ".gem", ".crate",
];

/// Version from the file name of a URL, e.g. `foo-1.2.3.tar.gz` gives `1.2.3`.
pub fn version_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let basename = path.trim_end_matches('/').rsplit('/').next()?;
    let stem = ARCHIVE_EXTENSIONS
        .iter()
        .find_map(|ext| basename.strip_suffix(ext))
        .unwrap_or(basename);

    let captures = version_regex()?.captures(stem)?;
    Some(captures.get(1)?.as_str().to_string())
}

fn version_from_tag(tag: &str) -> Option<String> {
    version_from_url(tag)
}
