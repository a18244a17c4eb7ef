// Integration tests for reference resolution and formula loading
// Each test builds its own prefix with taps, kegs and API files


use brulary::error::BruError;
use brulary::formula::{ResolvedSource, SpecKind};
use brulary::formulary::{Formulary, LoadOrigin, LoaderKind};
use brulary::platform::{Arch, MacOsVersion, Os, Platform};
use std::sync::Arc;
use test_helpers::{MockFetcher, TestEnvironment, formula_source};

fn linux() -> Platform {
    Platform::new(Os::Linux, Arch::X86_64)
}

fn arm_sonoma() -> Platform {
    Platform::new(Os::MacOs(MacOsVersion::Sonoma), Arch::Arm64)
}

fn online(env: &TestEnvironment) -> Formulary {
    env.seed_signed_indexes();
    Formulary::new(env.api(env.config(), MockFetcher::new()), linux())
}

fn offline(env: &TestEnvironment) -> Formulary {
    Formulary::new(env.api(env.offline_config(), MockFetcher::new()), linux())
}

mod precedence {
    use super::*;

    #[tokio::test]
    async fn test_local_path_wins_over_api() {
        let env = TestEnvironment::new();
        let formulary = online(&env);
        let path = env.temp_dir.path().join("foo.rb");
        std::fs::write(&path, formula_source("foo", "9.9")).unwrap();

        let loader = formulary
            .loader_for(path.to_str().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(loader.kind, LoaderKind::FromPath);
        assert_eq!(loader.source, ResolvedSource::LocalPath(path.clone()));

        let formula = formulary
            .factory(path.to_str().unwrap(), SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert_eq!(formula.version(), Some("9.9"));
        assert!(!formula.loaded_from_api());
    }

    #[tokio::test]
    async fn test_bare_name_uses_api() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        let loader = formulary.loader_for("foo", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Api);
        assert_eq!(loader.source, ResolvedSource::CoreApi("foo".into()));
    }

    #[tokio::test]
    async fn test_api_alias_resolves_to_target() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        let loader = formulary.loader_for("foo-alias", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Api);
        assert_eq!(loader.name, "foo");
        assert_eq!(
            loader.source,
            ResolvedSource::Alias {
                name: "foo-alias".into(),
                target: "foo".into()
            }
        );
        assert!(loader.alias_path.is_some());
    }

    #[tokio::test]
    async fn test_core_qualified_name_uses_api() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        let loader = formulary.loader_for("homebrew/core/bar", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Api);
        assert_eq!(loader.name, "bar");
    }

    #[tokio::test]
    async fn test_api_disabled_reads_core_tap() {
        let env = TestEnvironment::new();
        env.seed_signed_indexes();
        let core = env.tap("homebrew", "core");
        env.write_formula(&core, "foo", &formula_source("foo", "1.0"));
        let formulary = offline(&env);

        let loader = formulary.loader_for("foo", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Formula);
        assert_eq!(
            loader.source,
            ResolvedSource::TapQualified {
                tap: "homebrew/core".into(),
                name: "foo".into()
            }
        );
    }

    #[tokio::test]
    async fn test_core_alias() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        env.write_formula(&core, "python@3.12", &formula_source("python@3.12", "3.12.1"));
        env.write_alias(&core, "python3", "python@3.12");
        let formulary = offline(&env);

        let loader = formulary.loader_for("python3", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Alias);
        assert_eq!(loader.name, "python@3.12");

        let formula = formulary
            .factory("python3", SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert_eq!(formula.name, "python@3.12");
        assert_eq!(formula.class.class_name, "PythonAT312");
        assert!(formula.alias_path.is_some());
    }

    #[tokio::test]
    async fn test_alias_must_be_a_symlink() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        std::fs::create_dir_all(core.join("Aliases")).unwrap();
        std::fs::write(core.join("Aliases/python3"), "not a link").unwrap();
        let formulary = offline(&env);

        let loader = formulary.loader_for("python3", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Null);
    }

    #[tokio::test]
    async fn test_absolute_alias_path() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        env.write_formula(&core, "python@3.12", &formula_source("python@3.12", "3.12.1"));
        let link = env.write_alias(&core, "python3", "python@3.12");
        let formulary = offline(&env);

        let loader = formulary
            .loader_for(link.to_str().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(loader.kind, LoaderKind::Alias);
        assert_eq!(loader.name, "python@3.12");
        assert_eq!(
            loader.source,
            ResolvedSource::Alias {
                name: "python3".into(),
                target: "python@3.12".into()
            }
        );
    }

    #[tokio::test]
    async fn test_dangling_alias_is_unavailable() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        env.write_alias(&core, "python3", "python@3.12");
        let formulary = offline(&env);

        let loader = formulary.loader_for("python3", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Alias);

        let err = formulary
            .factory("python3", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }

    #[tokio::test]
    async fn test_single_other_tap() {
        let env = TestEnvironment::new();
        let tap = env.tap("alice", "tools");
        env.write_formula(&tap, "widget", &formula_source("widget", "0.3"));
        let formulary = offline(&env);

        let formula = formulary
            .factory("widget", SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert_eq!(formula.full_name, "alice/tools/widget");
        assert_eq!(formula.tap.as_ref().map(|t| t.name()).as_deref(), Some("alice/tools"));
    }

    #[tokio::test]
    async fn test_same_name_in_two_taps_is_ambiguous() {
        let env = TestEnvironment::new();
        for (user, repo) in [("alice", "tools"), ("bob", "extras")] {
            let tap = env.tap(user, repo);
            env.write_formula(&tap, "dup", &formula_source("dup", "1.0"));
        }
        let formulary = offline(&env);

        let err = formulary.loader_for("dup", None).await.unwrap_err();
        match err {
            BruError::TapFormulaAmbiguity { name, mut candidates } => {
                assert_eq!(name, "dup");
                candidates.sort();
                assert_eq!(candidates, ["alice/tools/dup", "bob/extras/dup"]);
            }
            other => panic!("expected ambiguity, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_qualified_reference_disambiguates() {
        let env = TestEnvironment::new();
        for (user, repo) in [("alice", "tools"), ("bob", "extras")] {
            let tap = env.tap(user, repo);
            env.write_formula(&tap, "dup", &formula_source("dup", "1.0"));
        }
        let formulary = offline(&env);

        let loader = formulary.loader_for("bob/extras/dup", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Tap);
        assert_eq!(loader.tap.unwrap().name(), "bob/extras");
    }
}

mod renames {
    use super::*;

    #[tokio::test]
    async fn test_core_rename() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        env.write_formula(&core, "newfoo", &formula_source("newfoo", "2.0"));
        env.write_renames(&core, &[("oldfoo", "newfoo")]);
        let formulary = offline(&env);

        let loader = formulary.loader_for("oldfoo", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Tap);
        assert_eq!(loader.name, "newfoo");
    }

    #[tokio::test]
    async fn test_rename_chain_is_followed() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        env.write_formula(&core, "c", &formula_source("c", "1.0"));
        env.write_renames(&core, &[("a", "b"), ("b", "c")]);
        let formulary = offline(&env);

        let formula = formulary
            .factory("a", SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert_eq!(formula.name, "c");
    }

    #[tokio::test]
    async fn test_rename_cycle_is_an_error() {
        let env = TestEnvironment::new();
        let core = env.tap("homebrew", "core");
        env.write_renames(&core, &[("a", "b"), ("b", "a")]);
        let formulary = offline(&env);

        let err = formulary.loader_for("a", None).await.unwrap_err();
        assert!(matches!(err, BruError::RenameCycle { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_other_tap_rename() {
        let env = TestEnvironment::new();
        let tap = env.tap("alice", "tools");
        env.write_formula(&tap, "gizmo", &formula_source("gizmo", "1.0"));
        env.write_renames(&tap, &[("gadget", "gizmo")]);
        let formulary = offline(&env);

        let loader = formulary.loader_for("gadget", None).await.unwrap();
        assert_eq!(loader.name, "gizmo");
        assert_eq!(loader.tap.unwrap().name(), "alice/tools");
    }

    #[tokio::test]
    async fn test_rename_in_two_taps_is_ambiguous() {
        let env = TestEnvironment::new();
        for (user, repo) in [("alice", "tools"), ("bob", "extras")] {
            let tap = env.tap(user, repo);
            env.write_formula(&tap, "gizmo", &formula_source("gizmo", "1.0"));
            env.write_renames(&tap, &[("gadget", "gizmo")]);
        }
        let formulary = offline(&env);

        let err = formulary.loader_for("gadget", None).await.unwrap_err();
        assert!(
            matches!(err, BruError::TapFormulaWithOldnameAmbiguity { ref candidates, .. } if candidates.len() == 2),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_tap_migration() {
        let env = TestEnvironment::new();
        let old = env.tap("alice", "tools");
        env.write_migrations(&old, &[("moved", "bob/extras")]);
        let new = env.tap("bob", "extras");
        env.write_formula(&new, "moved", &formula_source("moved", "1.0"));
        let formulary = offline(&env);

        let loader = formulary.loader_for("alice/tools/moved", None).await.unwrap();
        assert_eq!(loader.tap.unwrap().name(), "bob/extras");
        assert!(loader.path.is_file());
    }

    #[tokio::test]
    async fn test_migration_into_core_prefers_api() {
        let env = TestEnvironment::new();
        let old = env.tap("alice", "tools");
        env.write_migrations(&old, &[("foo", "homebrew/core")]);
        let formulary = online(&env);

        let loader = formulary
            .loader_for("alice/tools/foo", Some(LoadOrigin::Keg))
            .await
            .unwrap();
        assert_eq!(loader.kind, LoaderKind::Api);
        assert_eq!(loader.name, "foo");
    }
}

mod fallbacks {
    use super::*;

    #[tokio::test]
    async fn test_keg_definition_copy() {
        let env = TestEnvironment::new();
        env.install_keg("legacy", "1.0", None, Some(&formula_source("legacy", "1.0")));
        let formulary = offline(&env);

        let loader = formulary.loader_for("legacy", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Keg);

        let formula = formulary
            .factory("legacy", SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert_eq!(formula.version(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_previously_downloaded_file() {
        let env = TestEnvironment::new();
        let dir = env.cache.join("Formula");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fetched.rb"), formula_source("fetched", "0.1")).unwrap();
        let formulary = offline(&env);

        let loader = formulary.loader_for("fetched", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Cached);
    }

    #[tokio::test]
    async fn test_nothing_matches() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        let loader = formulary.loader_for("does-not-exist", None).await.unwrap();
        assert_eq!(loader.kind, LoaderKind::Null);

        let err = formulary
            .factory("does-not-exist", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BruError::FormulaUnavailable(ref name) if name == "does-not-exist"));
    }

    #[tokio::test]
    async fn test_missing_tap_formula_is_tap_qualified() {
        let env = TestEnvironment::new();
        env.tap("alice", "tools");
        let formulary = offline(&env);

        let err = formulary
            .factory("alice/tools/absent", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, BruError::TapFormulaUnavailable { ref tap, ref name } if tap == "alice/tools" && name == "absent"),
            "{err}"
        );
    }
}

mod loading {
    use super::*;

    #[tokio::test]
    async fn test_broken_tap_formula_is_unreadable() {
        let env = TestEnvironment::new();
        let tap = env.tap("alice", "tools");
        env.write_formula(&tap, "broken", "class Broken < Formula\n  url \"https://x\n");
        let formulary = offline(&env);

        let err = formulary
            .factory("alice/tools/broken", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BruError::TapFormulaUnreadable { .. }), "{err}");
        assert!(err.is_unreadable());
    }

    #[tokio::test]
    async fn test_wrong_class_lists_defined_classes() {
        let env = TestEnvironment::new();
        let tap = env.tap("alice", "tools");
        env.write_formula(&tap, "thing", &formula_source("other", "1.0"));
        let formulary = offline(&env);

        let err = formulary
            .factory("alice/tools/thing", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        match err {
            BruError::TapFormulaClassUnavailable { class_list, .. } => {
                assert_eq!(class_list, ["Other"]);
            }
            other => panic!("expected class error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_loading_can_be_disabled() {
        let env = TestEnvironment::new();
        let tap = env.tap("alice", "tools");
        env.write_formula(&tap, "widget", &formula_source("widget", "1.0"));
        let mut config = env.offline_config();
        config.disable_load_formula = true;
        let formulary = Formulary::new(env.api(config, MockFetcher::new()), linux());

        let err = formulary
            .factory("widget", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BruError::LoadingDisabled), "{err}");
    }

    #[tokio::test]
    async fn test_arbitrary_url_is_refused() {
        let env = TestEnvironment::new();
        let formulary = offline(&env);

        let loader = formulary
            .loader_for("https://example.com/formulae/tool.rb", None)
            .await
            .unwrap();
        assert_eq!(loader.name, "tool");
        assert!(matches!(loader.kind, LoaderKind::FromUrl { .. }));

        let err = formulary
            .factory("https://example.com/formulae/tool.rb", SpecKind::Stable, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BruError::UnsupportedInstallationMethod(_)), "{err}");
    }

    #[tokio::test]
    async fn test_file_url_is_copied_and_compiled() {
        let env = TestEnvironment::new();
        let source = env.temp_dir.path().join("tool.rb");
        std::fs::write(&source, formula_source("tool", "3.1")).unwrap();
        let url = format!("file://{}", source.display());
        let formulary = offline(&env);

        let formula = formulary
            .factory(&url, SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert_eq!(formula.version(), Some("3.1"));
        assert!(env.cache.join("Formula/tool.rb").is_file());
    }

    #[tokio::test]
    async fn test_from_contents() {
        let env = TestEnvironment::new();
        let formulary = offline(&env);
        let path = env.temp_dir.path().join("inline.rb");

        let formula = formulary
            .from_contents("inline", &path, &formula_source("inline", "4.2"), SpecKind::Stable)
            .await
            .unwrap();
        assert_eq!(formula.pkg_version().as_deref(), Some("4.2"));
    }

    #[tokio::test]
    async fn test_missing_head_spec_falls_back_to_stable() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        let formula = formulary
            .factory("foo", SpecKind::Head, None, None)
            .await
            .unwrap();
        assert_eq!(formula.requested_spec, SpecKind::Head);
        assert_eq!(formula.active_spec, SpecKind::Stable);
        assert_eq!(formula.version(), Some("1.2.3"));
    }
}

mod caching {
    use super::*;

    #[tokio::test]
    async fn test_api_class_is_shared() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        let first = formulary.factory("foo", SpecKind::Stable, None, None).await.unwrap();
        let second = formulary
            .factory("foo-alias", SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert!(first.loaded_from_api());
        assert!(Arc::ptr_eq(&first.class, &second.class));
    }

    #[tokio::test]
    async fn test_path_class_is_shared() {
        let env = TestEnvironment::new();
        let tap = env.tap("alice", "tools");
        env.write_formula(&tap, "widget", &formula_source("widget", "1.0"));
        let formulary = offline(&env);

        let first = formulary.factory("widget", SpecKind::Stable, None, None).await.unwrap();
        let second = formulary
            .factory("alice/tools/widget", SpecKind::Stable, None, None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first.class, &second.class));
    }

    #[tokio::test]
    async fn test_platform_switch_recompiles() {
        let env = TestEnvironment::new();
        let mut formulary = online(&env);

        let on_linux = formulary.factory("foo", SpecKind::Stable, None, None).await.unwrap();
        assert_eq!(on_linux.class.caveats.as_deref(), Some("linux only"));

        formulary.set_platform(arm_sonoma());
        let on_mac = formulary.factory("foo", SpecKind::Stable, None, None).await.unwrap();
        assert!(!Arc::ptr_eq(&on_linux.class, &on_mac.class));
        assert_eq!(on_mac.class.caveats, None);

        let names: Vec<&str> = on_linux.dependencies().iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"zlib"));
    }

    #[tokio::test]
    async fn test_same_platform_keeps_cache() {
        let env = TestEnvironment::new();
        let mut formulary = online(&env);

        let first = formulary.factory("foo", SpecKind::Stable, None, None).await.unwrap();
        formulary.set_platform(linux());
        let second = formulary.factory("foo", SpecKind::Stable, None, None).await.unwrap();
        assert!(Arc::ptr_eq(&first.class, &second.class));
    }
}

mod installed {
    use super::*;

    #[tokio::test]
    async fn test_keg_only_from_rack() {
        let env = TestEnvironment::new();
        env.install_keg("bar", "2.0", Some("homebrew/core"), None);
        env.install_keg("foo", "1.2.3", Some("homebrew/core"), None);
        let formulary = online(&env);

        assert!(formulary.keg_only(&env.cellar.join("bar")).await.unwrap());
        assert!(!formulary.keg_only(&env.cellar.join("foo")).await.unwrap());
        assert!(!formulary.keg_only(&env.cellar.join("unknown")).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_attaches_receipt() {
        let env = TestEnvironment::new();
        env.install_keg("foo", "1.2.3", Some("homebrew/core"), None);
        let formulary = online(&env);

        let formula = formulary.resolve("foo", None).await.unwrap();
        assert_eq!(formula.name, "foo");
        assert!(formula.build.is_some());
        assert!(!formula.follow_installed_alias);
        assert_eq!(formula.installed_kegs(&env.cellar).len(), 1);
    }

    #[tokio::test]
    async fn test_to_rack_and_canonical_name() {
        let env = TestEnvironment::new();
        let formulary = online(&env);

        assert_eq!(formulary.canonical_name("foo-alias").await.unwrap(), "foo");
        let rack = formulary.to_rack("foo-alias").await.unwrap();
        assert_eq!(rack, env.cellar.join("foo"));
    }
}
