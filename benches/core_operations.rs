use brulary::api::merge_variations;
use brulary::dsl::Document;
use brulary::formula::class_s;
use brulary::platform::{Arch, MacOsVersion, Os, Platform};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

const FORMULA: &str = r#"
class Foo < Formula
  desc "Foo tool"
  homepage "https://example.com/foo"
  url "https://example.com/foo-1.2.3.tar.gz"
  sha256 "abc"
  license "MIT"

  depends_on "pkgconf" => :build
  depends_on "bar"
  uses_from_macos "zlib"

  on_linux do
    depends_on "linux-dep"
  end

  def install
    system "make", "install"
  end
end
"#;

fn bench_class_s(c: &mut Criterion) {
    let names = ["foo", "foo-bar", "python@3.12", "libxml++", "a_b-c.d"];

    c.bench_function("class_s", |b| {
        b.iter(|| {
            for name in &names {
                let _ = class_s(black_box(name));
            }
        })
    });
}

fn bench_merge_variations(c: &mut Criterion) {
    let record = json!({
        "name": "foo",
        "dependencies": ["bar"],
        "caveats": null,
        "variations": {
            "x86_64_linux": {"dependencies": ["bar", "zlib"], "caveats": "linux only"},
            "arm64_sonoma": {"dependencies": []},
        }
    });
    let mut group = c.benchmark_group("merge_variations");

    for (label, platform) in [
        ("matching", Platform::new(Os::Linux, Arch::X86_64)),
        ("unmatched", Platform::new(Os::MacOs(MacOsVersion::Sequoia), Arch::Arm64)),
    ] {
        group.bench_with_input(BenchmarkId::new(label, 0), &platform, |b, platform| {
            b.iter(|| merge_variations(black_box(&record), platform))
        });
    }

    group.finish();
}

fn bench_parse_definition(c: &mut Criterion) {
    c.bench_function("parse formula definition", |b| {
        b.iter(|| Document::parse(black_box(FORMULA)))
    });
}

criterion_group!(benches, bench_class_s, bench_merge_variations, bench_parse_definition);
criterion_main!(benches);
