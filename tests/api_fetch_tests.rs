// Integration tests for the API metadata fetcher
// Exercise domain fallback, freshness, corrupt-file retries and signature checks


use brulary::cache::PackageKind;
use brulary::config::DEFAULT_API_DOMAIN;
use brulary::error::BruError;
use std::time::{Duration, SystemTime};
use test_helpers::{Call, MockFetcher, SIGNED_FORMULAE, TestEnvironment};

const MIRROR: &str = "https://mirror.example.com/api";

fn default_url(endpoint: &str) -> String {
    format!("{}/{}", DEFAULT_API_DOMAIN, endpoint)
}

fn mirror_url(endpoint: &str) -> String {
    format!("{}/{}", MIRROR, endpoint)
}

#[tokio::test]
async fn test_fetch_falls_back_to_default_domain_and_memoizes() {
    let env = TestEnvironment::new();
    let fetcher = MockFetcher::new();
    fetcher.serve(&default_url("formula.json"), r#"[{"name":"foo"}]"#);

    let mut config = env.config();
    config.api_domain = MIRROR.to_string();
    let api = env.api(config, fetcher.clone());

    let json = api.fetch("formula.json").await.unwrap();
    assert_eq!(json[0]["name"], "foo");
    assert_eq!(
        fetcher.calls(),
        [
            Call::Get(mirror_url("formula.json")),
            Call::Get(default_url("formula.json"))
        ]
    );

    let again = api.fetch("formula.json").await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&json, &again));
    assert_eq!(fetcher.call_count(), 2, "memoized fetch must not hit the network");
}

#[tokio::test]
async fn test_fetch_retries_default_domain_only_once() {
    let env = TestEnvironment::new();
    let fetcher = MockFetcher::new();

    let mut config = env.config();
    config.api_domain = MIRROR.to_string();
    let api = env.api(config, fetcher.clone());

    let err = api.fetch("formula/nope.json").await.unwrap_err();
    assert!(matches!(err, BruError::NoFileFound(_)), "{err}");
    assert_eq!(fetcher.call_count(), 2);
}

#[tokio::test]
async fn test_fetch_without_mirror_makes_a_single_attempt() {
    let env = TestEnvironment::new();
    let fetcher = MockFetcher::new();
    let api = env.api(env.config(), fetcher.clone());

    assert!(api.fetch("cask/nope.json").await.is_err());
    assert_eq!(fetcher.calls(), [Call::Get(default_url("cask/nope.json"))]);
}

#[tokio::test]
async fn test_fetch_rejects_unparseable_body() {
    let env = TestEnvironment::new();
    let fetcher = MockFetcher::new();
    fetcher.serve(&default_url("formula/foo.json"), "<html>oops</html>");
    let api = env.api(env.config(), fetcher);

    let err = api.fetch("formula/foo.json").await.unwrap_err();
    assert!(matches!(err, BruError::InvalidJson(_)), "{err}");
}

#[tokio::test]
async fn test_fresh_file_skips_download() {
    let env = TestEnvironment::new();
    let target = env.seed_api_file("formula.json", r#"[{"name":"cached"}]"#);
    let fetcher = MockFetcher::new();

    let mut config = env.config();
    config.auto_update_command = true;
    let api = env.api(config, fetcher.clone());

    let (json, fresh) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json[0]["name"], "cached");
    assert!(!fresh);
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn test_stale_file_is_redownloaded_in_update_commands() {
    let env = TestEnvironment::new();
    let target = env.seed_api_file("formula.json", r#"[{"name":"old"}]"#);
    let old = SystemTime::now() - Duration::from_secs(3600);
    std::fs::File::options()
        .write(true)
        .open(&target)
        .unwrap()
        .set_modified(old)
        .unwrap();

    let fetcher = MockFetcher::new();
    fetcher.serve(&default_url("formula.json"), r#"[{"name":"new"}]"#);
    let mut config = env.config();
    config.auto_update_command = true;
    let api = env.api(config, fetcher.clone());

    let (json, fresh) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json[0]["name"], "new");
    assert!(fresh);
    assert!(std::fs::metadata(&target).unwrap().modified().unwrap() > old);
}

#[tokio::test]
async fn test_stale_file_is_kept_outside_update_commands() {
    let env = TestEnvironment::new();
    let target = env.seed_api_file("formula.json", r#"[{"name":"old"}]"#);
    std::fs::File::options()
        .write(true)
        .open(&target)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    let fetcher = MockFetcher::new();
    let api = env.api(env.config(), fetcher.clone());

    let (json, fresh) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json[0]["name"], "old");
    assert!(!fresh);
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn test_repeated_corruption_gives_up_and_removes_target() {
    let env = TestEnvironment::new();
    let target = env.api_file("formula.json");
    let fetcher = MockFetcher::new();
    fetcher.serve(&default_url("formula.json"), "{ truncated");

    let mut config = env.config();
    config.curl_retries = 2;
    let api = env.api(config, fetcher.clone());

    let err = api.fetch_json_api_file("formula.json", &target).await.unwrap_err();
    assert!(matches!(err, BruError::CannotDownload(_)), "{err}");
    assert!(!target.exists());
    // First attempt plus one per allowed retry.
    assert_eq!(fetcher.call_count(), 3);
}

#[tokio::test]
async fn test_mirror_failure_downloads_from_default_domain() {
    let env = TestEnvironment::new();
    let target = env.api_file("formula.json");
    let fetcher = MockFetcher::new();
    fetcher.serve(&default_url("formula.json"), r#"[{"name":"foo"}]"#);

    let mut config = env.config();
    config.api_domain = MIRROR.to_string();
    let api = env.api(config, fetcher.clone());

    let (json, fresh) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json[0]["name"], "foo");
    assert!(fresh);
    assert_eq!(
        fetcher.calls(),
        [
            Call::Download(mirror_url("formula.json")),
            Call::Download(default_url("formula.json"))
        ]
    );
}

#[tokio::test]
async fn test_missing_file_without_network_is_an_error() {
    let env = TestEnvironment::new();
    let target = env.api_file("formula.json");
    let api = env.api(env.config(), MockFetcher::new());

    let err = api.fetch_json_api_file("formula.json", &target).await.unwrap_err();
    assert!(matches!(err, BruError::Download { .. }), "{err}");
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_cached_copy() {
    let env = TestEnvironment::new();
    let target = env.seed_api_file("formula.json", r#"[{"name":"cached"}]"#);
    std::fs::File::options()
        .write(true)
        .open(&target)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    let mut config = env.config();
    config.auto_update_command = true;
    let api = env.api(config, MockFetcher::new());

    let (json, _) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json[0]["name"], "cached");
}

#[tokio::test]
async fn test_privileged_user_without_ownership_never_downloads() {
    let env = TestEnvironment::new();
    let target = env.api_file("formula.json");
    let fetcher = MockFetcher::new();
    fetcher.serve(&default_url("formula.json"), "[]");

    let mut config = env.config();
    config.running_as_root_but_not_owned_by_root = true;
    let api = env.api(config, fetcher.clone());

    let err = api.fetch_json_api_file("formula.json", &target).await.unwrap_err();
    assert!(matches!(err, BruError::DownloadAsRootRefused(_)), "{err}");
    assert_eq!(fetcher.call_count(), 0);

    env.seed_api_file("formula.json", r#"[{"name":"cached"}]"#);
    let (json, fresh) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json[0]["name"], "cached");
    assert!(!fresh);
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn test_signed_endpoint_is_verified() {
    let env = TestEnvironment::new();
    let target = env.seed_api_file("formula.jws.json", SIGNED_FORMULAE);
    let api = env.api(env.config(), MockFetcher::new());

    let (json, _) = api
        .fetch_json_api_file("formula.jws.json", &target)
        .await
        .unwrap();
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|record| record["name"].as_str())
        .collect();
    assert_eq!(names, ["foo", "bar", "python@3.12"]);
}

#[tokio::test]
async fn test_tampered_signed_file_is_deleted() {
    let env = TestEnvironment::new();
    let tampered = SIGNED_FORMULAE.replacen("foo test formula", "evil test formula", 1);
    let target = env.seed_api_file("formula.jws.json", &tampered);
    let api = env.api(env.config(), MockFetcher::new());

    let err = api
        .fetch_json_api_file("formula.jws.json", &target)
        .await
        .unwrap_err();
    assert!(matches!(err, BruError::Integrity { .. }), "{err}");
    assert!(!target.exists());
}

#[tokio::test]
async fn test_unsigned_endpoint_skips_verification() {
    let env = TestEnvironment::new();
    let target = env.seed_api_file("formula.json", r#"{"payload":"x","signatures":[]}"#);
    let api = env.api(env.config(), MockFetcher::new());

    let (json, _) = api.fetch_json_api_file("formula.json", &target).await.unwrap();
    assert_eq!(json["payload"], "x");
}

#[tokio::test]
async fn test_index_loading_writes_names_file_once() {
    let env = TestEnvironment::new();
    env.seed_signed_indexes();
    let api = env.api(env.config(), MockFetcher::new());

    let index = api.formula_index().await.unwrap();
    assert_eq!(index.len(), 3);
    assert!(!index.freshly_downloaded);
    assert_eq!(index.alias_target("foo-alias"), Some("foo"));

    let names_file = env.cache.join("api/formula_names.txt");
    assert_eq!(
        std::fs::read_to_string(&names_file).unwrap(),
        "bar\nfoo\npython@3.12"
    );

    std::fs::write(&names_file, "edited").unwrap();
    assert!(!api
        .write_names_file(&index.names(), PackageKind::Formula, false)
        .unwrap());
    assert_eq!(std::fs::read_to_string(&names_file).unwrap(), "edited");

    assert!(api
        .write_names_file(&index.names(), PackageKind::Formula, true)
        .unwrap());
    assert_eq!(
        std::fs::read_to_string(&names_file).unwrap(),
        "bar\nfoo\npython@3.12"
    );
}

#[tokio::test]
async fn test_index_is_shared_through_the_cache() {
    let env = TestEnvironment::new();
    env.seed_signed_indexes();
    let api = env.api(env.config(), MockFetcher::new());

    let first = api.cask_index().await.unwrap();
    std::fs::remove_file(env.api_file("cask.jws.json")).unwrap();
    let second = api.cask_index().await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert!(api.has_cask("firefox").await.unwrap());
}

#[tokio::test]
async fn test_cask_source_falls_back_to_api_copy() {
    let env = TestEnvironment::new();
    let fetcher = MockFetcher::new();
    let source = "cask \"firefox\" do\nend\n";
    fetcher.serve(&default_url("cask-source/firefox.rb"), source);
    let api = env.api(env.config(), fetcher.clone());

    let text = api
        .fetch_cask_source("firefox", "Casks/f/firefox.rb", "abc123", None)
        .await
        .unwrap();
    assert_eq!(&*text, source);
    assert_eq!(
        fetcher.calls()[0],
        Call::Get(
            "https://raw.githubusercontent.com/Homebrew/homebrew-cask/abc123/Casks/f/firefox.rb"
                .into()
        )
    );

    let err = api
        .fetch_cask_source("firefox", "Casks/f/firefox.rb", "other", Some("00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BruError::Sha256Mismatch { .. }), "{err}");
}
