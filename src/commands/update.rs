use brulary::Api;
use brulary::cache::PackageKind;
use colored::Colorize;

pub async fn update(api: &Api, force: bool) -> anyhow::Result<()> {
    let spinner = super::spinner("Updating API data...".to_string());
    let formulae = api.formula_index().await;
    let casks = api.cask_index().await;
    spinner.finish_and_clear();

    let formulae = formulae?;
    let casks = casks?;

    if force {
        api.write_names_file(&formulae.names(), PackageKind::Formula, true)?;
        api.write_names_file(&casks.names(), PackageKind::Cask, true)?;
    }

    for (label, fresh, count) in [
        ("formulae", formulae.freshly_downloaded, formulae.len()),
        ("casks", casks.freshly_downloaded, casks.len()),
    ] {
        let state = if fresh { "updated".green() } else { "already up to date".dimmed() };
        println!(
            "  {} {} {} ({})",
            "✓".green(),
            count.to_string().bold(),
            label,
            state
        );
    }
    Ok(())
}
