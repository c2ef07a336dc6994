//! Compare command implementation

use anyhow::Result;
use colored::Colorize;

use super::Options;
use crate::compare;
use crate::config::Config;
use crate::manifest::{ManifestLoader, ManifestRef};
use crate::net::Probe;
use crate::package::{Layout, RecordBuilder};
use crate::patch::PatchTable;
use crate::pkgutil::Pkgutil;
use crate::source::SourceReader;

/// Print the package differences between two manifests
pub fn run(options: &Options, config: &Config, probe: &dyn Probe) -> Result<()> {
    // Oldest first
    let mut names = options.compare.clone();
    names.sort();

    let feed_url = &config.feed.feed_url;
    let layout = Layout::new(feed_url, &options.destination);
    let database = Pkgutil;
    let patches = PatchTable::load(config.paths.patches.as_deref())?;
    let loader = ManifestLoader::new(probe, &config.feed, &config.paths.work_dir);
    let builder = RecordBuilder::new(&layout, probe, &database);
    let reader = SourceReader::new(&loader, &patches, &builder);

    let a = ManifestRef::resolve(&names[0], feed_url);
    let b = ManifestRef::resolve(&names[1], feed_url);
    let style = options.compare_style.unwrap_or_default();

    println!("{}", format!("Comparing {} and {}", a, b).cyan());
    println!();

    for line in compare::compare(&reader, &a, &b, style)? {
        if line.starts_with('-') {
            println!("{}", line.red());
        } else if line.starts_with('+') {
            println!("{}", line.green());
        } else if line.starts_with("@@") {
            println!("{}", line.cyan());
        } else {
            println!("{}", line);
        }
    }

    Ok(())
}
