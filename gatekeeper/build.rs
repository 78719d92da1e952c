// Without `embed-ebpf` the daemon loads the classifier object from disk and
// this script has nothing to do.

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "embed-ebpf")]
    embed::build_classifier()?;
    Ok(())
}

#[cfg(feature = "embed-ebpf")]
mod embed {
    use anyhow::{Context as _, Result, anyhow};
    use aya_build::{Package, Toolchain};

    const CLASSIFIER_PACKAGE: &str = "gatekeeper-ebpf";

    pub fn build_classifier() -> Result<()> {
        let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
            .no_deps()
            .exec()
            .context("MetadataCommand::exec")?;
        let cargo_metadata::Package {
            name,
            manifest_path,
            ..
        } = packages
            .into_iter()
            .find(|cargo_metadata::Package { name, .. }| name.as_str() == CLASSIFIER_PACKAGE)
            .ok_or_else(|| anyhow!("{CLASSIFIER_PACKAGE} package not found"))?;
        let root_dir = manifest_path
            .parent()
            .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?;

        let classifier = Package {
            name: name.as_str(),
            root_dir: root_dir.as_str(),
            ..Default::default()
        };
        aya_build::build_ebpf([classifier], Toolchain::default())
    }
}
