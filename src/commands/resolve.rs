use brulary::Formulary;
use brulary::formulary::LoaderKind;
use colored::Colorize;

pub async fn resolve(formulary: &Formulary, references: &[String]) -> anyhow::Result<()> {
    let mut unresolved = 0;

    for reference in references {
        match formulary.loader_for(reference, None).await {
            Ok(loader) if loader.kind == LoaderKind::Null => {
                unresolved += 1;
                let error = brulary::BruError::FormulaUnavailable(reference.clone());
                super::report(formulary.api(), reference, &error).await;
            }
            Ok(loader) => {
                println!("{} {} {}", reference.bold(), "→".dimmed(), loader.source);
                if !loader.path.as_os_str().is_empty() {
                    println!("  {}", loader.path.display().to_string().dimmed());
                }
            }
            Err(e) => {
                unresolved += 1;
                super::report(formulary.api(), reference, &e).await;
            }
        }
    }

    if unresolved > 0 {
        anyhow::bail!("{} of {} references could not be resolved", unresolved, references.len());
    }
    Ok(())
}
