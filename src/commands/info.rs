use brulary::formula::{DependencyKind, Formula};
use brulary::{Formulary, SpecKind};
use colored::Colorize;

pub async fn info(formulary: &Formulary, reference: &str, head: bool, json: bool) -> anyhow::Result<()> {
    let spec = if head { SpecKind::Head } else { SpecKind::Stable };
    let spinner = if json {
        indicatif::ProgressBar::hidden()
    } else {
        super::spinner(format!("Resolving {}...", reference))
    };

    let formula = match formulary.factory(reference, spec, None, None).await {
        Ok(formula) => formula,
        Err(e) => {
            spinner.finish_and_clear();
            super::report(formulary.api(), reference, &e).await;
            return Err(e.into());
        }
    };
    spinner.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&*formula.class)?);
        return Ok(());
    }

    print_formula(formulary, &formula);
    Ok(())
}

fn print_formula(formulary: &Formulary, formula: &Formula) {
    let class = &formula.class;
    let version = formula.pkg_version().unwrap_or_else(|| "?".to_string());
    println!(
        "{}",
        format!("==> {}: {} {}", formula.full_name, formula.active_spec, version)
            .bold()
            .green()
    );
    if let Some(desc) = &class.desc {
        println!("{}", desc);
    }
    if let Some(homepage) = &class.homepage {
        println!("{}: {}", "Homepage".bold(), homepage);
    }
    if let Some(license) = &class.license {
        println!("{}: {}", "License".bold(), license);
    }
    println!("{}: {}", "From".bold(), formula.source.to_string().dimmed());

    if let Some(keg_only) = &class.keg_only {
        println!("{}: {}", "Keg-only".bold().yellow(), keg_only.reason);
        if !keg_only.explanation.is_empty() {
            println!("  {}", keg_only.explanation.dimmed());
        }
    }
    if let Some(deprecation) = &class.deprecation {
        println!("{}: since {}", "Deprecated".bold().yellow(), deprecation.date);
    }
    if let Some(disable) = &class.disable {
        println!("{}: since {}", "Disabled".bold().red(), disable.date);
    }

    let tag = formulary.platform().bottle_tag();
    let bottled = class
        .bottle
        .as_ref()
        .and_then(|bottle| bottle.file_for(&tag))
        .is_some();
    println!(
        "{}: {}",
        "Bottle".bold(),
        if bottled { tag.green() } else { "none for this platform".dimmed() }
    );

    for (label, kind) in [
        ("Dependencies", DependencyKind::Runtime),
        ("Build", DependencyKind::Build),
        ("Test", DependencyKind::Test),
        ("Recommended", DependencyKind::Recommended),
        ("Optional", DependencyKind::Optional),
    ] {
        let names: Vec<&str> = formula
            .dependencies()
            .iter()
            .filter(|dep| dep.kind == kind)
            .map(|dep| dep.name.as_str())
            .collect();
        if !names.is_empty() {
            println!("{}: {}", label.bold(), names.join(", "));
        }
    }

    let cellar = &formulary.config().cellar;
    let kegs = formula.installed_kegs(cellar);
    if kegs.is_empty() {
        println!("{}", "Not installed".dimmed());
    } else {
        println!("{}: {} versions installed", "Installed".bold(), kegs.len());
        for keg in &kegs {
            println!("  {}", keg.path.display().to_string().dimmed());
        }
    }

    if let Some(caveats) = &class.caveats {
        println!("{}", "==> Caveats".bold());
        println!("{}", caveats.trim_end());
    }
}
