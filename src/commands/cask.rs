use brulary::CaskLoader;
use brulary::cask::OutdatedOptions;
use colored::Colorize;

pub async fn cask(loader: &CaskLoader, reference: &str, source: bool, greedy: bool) -> anyhow::Result<()> {
    let spinner = super::spinner(format!("Loading cask {}...", reference));
    let cask = loader.load(reference).await;
    spinner.finish_and_clear();

    let cask = match cask {
        Ok(cask) => cask,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            return Err(e.into());
        }
    };

    if source {
        print!("{}", loader.source(&cask).await?);
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "==> {}: {}",
            cask.full_name(),
            cask.version.as_deref().unwrap_or("?")
        )
        .bold()
        .green()
    );
    if !cask.names.is_empty() {
        println!("{}", cask.names.join(", "));
    }
    if let Some(desc) = &cask.desc {
        println!("{}", desc);
    }
    if let Some(homepage) = &cask.homepage {
        println!("{}: {}", "Homepage".bold(), homepage);
    }
    if let Some(url) = &cask.url {
        println!("{}: {}", "URL".bold(), url.dimmed());
    }
    println!("{}: {}", "From".bold(), cask.source.to_string().dimmed());

    let apps = cask.apps();
    if !apps.is_empty() {
        println!("{}: {}", "Apps".bold(), apps.join(", "));
    }
    if cask.auto_updates {
        println!("{}", "Auto-updates".dimmed());
    }

    let versions = cask.versions();
    if versions.is_empty() {
        println!("{}", "Not installed".dimmed());
    } else {
        println!("{}: {}", "Installed".bold(), versions.join(", "));
        let options = OutdatedOptions {
            greedy,
            ..OutdatedOptions::default()
        };
        let outdated = cask.outdated_versions(options, cask.sha256.as_deref());
        if !outdated.is_empty() {
            println!("{}: {}", "Outdated".bold().yellow(), outdated.join(", "));
        }
    }

    if let Some(caveats) = &cask.caveats {
        println!("{}", "==> Caveats".bold());
        println!("{}", caveats.trim_end());
    }
    Ok(())
}
