//! Dialplan documents in TOML.
//!
//! ```toml
//! [globals]
//! OPERATOR = "SIP/100"
//!
//! [[context]]
//! name = "office"
//! includes = ["parking", "afterhours,18:00-08:00,mon-fri,*,*"]
//! ignore_patterns = ["9"]
//!
//! [[context.extension]]
//! exten = "_1XX"
//! priority = 1
//! app = "Dial"
//! data = "SIP/${EXTEN}"
//!
//! [[context.extension]]
//! exten = "_1XX"
//! priority = "n"
//! app = "Hangup"
//!
//! [[context.extension]]
//! exten = "100"
//! priority = "hint"
//! app = "SIP/100&SIP/101"
//! data = "Reception"
//! ```
//!
//! A whole document becomes one generation, merged in one step for its
//! registrar. Nothing is touched when the document has an error.

use std::collections::{BTreeMap, HashMap};
use std::{fs, path::Path};

use anyhow::{anyhow, bail, Context as _, Result};
use serde::Deserialize;
use tracing::info;

use crate::engine::Engine;
use crate::priority::PRIORITY_HINT;
use crate::registry::{Generation, NewExtension};

#[derive(Deserialize, Debug, Clone, Default)]
pub struct DialplanFile {
    #[serde(default)]
    pub globals: BTreeMap<String, String>,
    #[serde(default, rename = "context")]
    pub contexts: Vec<ContextDecl>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ContextDecl {
    pub name: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default, rename = "switch")]
    pub switches: Vec<SwitchDecl>,
    #[serde(default, rename = "extension")]
    pub extensions: Vec<ExtensionDecl>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SwitchDecl {
    pub name: String,
    #[serde(default)]
    pub data: String,
    /// Substitute `data` each time the switch is asked.
    #[serde(default)]
    pub eval: bool,
}

/// One priority. For hints `app` carries the devices and `data` the
/// display name.
#[derive(Deserialize, Debug, Clone)]
pub struct ExtensionDecl {
    pub exten: String,
    pub priority: PriorityDecl,
    pub label: Option<String>,
    pub cidmatch: Option<String>,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PriorityDecl {
    Number(i32),
    /// `"n"` for one after the previous priority of the extension,
    /// `"hint"` for the hint.
    Keyword(String),
}

impl DialplanFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<DialplanFile> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading dialplan {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<DialplanFile> {
        let file: DialplanFile = toml::from_str(contents)?;
        Ok(file)
    }

    /// Builds the generation this document describes.
    pub fn generation(&self, registrar: &str) -> Result<Generation> {
        let mut generation = Generation::new(registrar);
        for decl in &self.contexts {
            generation
                .create_context(&decl.name)
                .with_context(|| format!("context {}", decl.name))?;
            fill_context(&generation, decl, registrar)
                .with_context(|| format!("context {}", decl.name))?;
        }
        Ok(generation)
    }
}

fn fill_context(generation: &Generation, decl: &ContextDecl, registrar: &str) -> Result<()> {
    let context = decl.name.as_str();
    for include in &decl.includes {
        generation.add_include(context, include)?;
    }
    for pattern in &decl.ignore_patterns {
        generation.add_ignorepattern(context, pattern)?;
    }
    for switch in &decl.switches {
        generation.add_switch(context, &switch.name, &switch.data, switch.eval)?;
    }

    let mut last: HashMap<(&str, Option<&str>), i32> = HashMap::new();
    for exten in &decl.extensions {
        let key = (exten.exten.as_str(), exten.cidmatch.as_deref());
        let priority = match &exten.priority {
            PriorityDecl::Number(n) if *n >= 1 => *n,
            PriorityDecl::Number(n) => bail!("extension {} has priority {n}", exten.exten),
            PriorityDecl::Keyword(word) => match word.trim().to_lowercase().as_str() {
                "hint" => PRIORITY_HINT,
                "n" => last.get(&key).map_or(1, |p| p + 1),
                _ => bail!("extension {} has priority {word}", exten.exten),
            },
        };
        if priority != PRIORITY_HINT {
            last.insert(key, priority);
        }

        let mut new = NewExtension::new(&exten.exten, priority, &exten.app, &exten.data)
            .registrar(registrar);
        if let Some(label) = &exten.label {
            new = new.label(label);
        }
        if let Some(cidmatch) = &exten.cidmatch {
            new = new.cidmatch(cidmatch);
        }
        generation
            .add_extension(context, new, false)
            .map_err(|err| anyhow!("{}: {err}", exten.exten))?;
    }
    Ok(())
}

/// Replaces everything `registrar` loaded before with `file`. Returns the
/// number of contexts merged.
pub fn load(engine: &Engine, file: &DialplanFile, registrar: &str) -> Result<usize> {
    let generation = file.generation(registrar)?;
    let contexts = generation.contexts().len();
    for (name, value) in &file.globals {
        engine.globals().set(name, value);
    }
    engine.registry().merge_generation(generation);
    info!(registrar = %registrar, "loaded {contexts} contexts");
    Ok(contexts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hint::ExtensionState;

    const DIALPLAN: &str = r#"
        [globals]
        OPERATOR = "SIP/100"

        [[context]]
        name = "office"
        includes = ["parking"]
        ignore_patterns = ["9"]

        [[context.switch]]
        name = "Remote"
        data = "${OPERATOR}"
        eval = true

        [[context.extension]]
        exten = "_1XX"
        priority = 1
        label = "start"
        app = "Answer"

        [[context.extension]]
        exten = "_1XX"
        priority = "n"
        app = "Dial"
        data = "SIP/${EXTEN}"

        [[context.extension]]
        exten = "_1XX"
        priority = "n"
        label = "end"
        app = "Hangup"

        [[context.extension]]
        exten = "100"
        priority = "hint"
        app = "SIP/100&SIP/101"
        data = "Reception"

        [[context]]
        name = "parking"

        [[context.extension]]
        exten = "700"
        priority = 1
        cidmatch = "555"
        app = "NoOp"
    "#;

    #[test]
    fn loads_contexts_and_globals() {
        let engine = Engine::new(Config::default());
        let file = DialplanFile::from_toml(DIALPLAN).unwrap();
        assert_eq!(2, load(&engine, &file, "loader").unwrap());

        assert_eq!(Some("SIP/100".to_string()), engine.globals().get("OPERATOR"));
        assert_eq!(Some(3), engine.findlabel(None, "office", "150", "end", None));
        assert!(engine.exists(None, "office", "700", 1, Some("555")));
        assert!(!engine.exists(None, "office", "700", 1, Some("556")));
        assert!(engine.registry().ignore_pattern("office", "9"));
        assert_eq!(
            Some(("SIP/100&SIP/101".to_string(), "Reception".to_string())),
            engine.get_hint(None, "office", "100")
        );
        assert_eq!(
            ExtensionState::NotInUse,
            engine.extension_state("office", "100").unwrap()
        );

        let office = engine.registry().find_context("office").unwrap();
        assert_eq!("loader", office.registrar());
        assert_eq!(1, office.switches().len());
        assert_eq!("parking", office.includes()[0].name);
    }

    #[test]
    fn reload_replaces_only_own_contexts() {
        let engine = Engine::new(Config::default());
        engine.registry().create_context("manual", "cli").unwrap();
        load(&engine, &DialplanFile::from_toml(DIALPLAN).unwrap(), "loader").unwrap();

        let smaller = DialplanFile::from_toml(
            r#"
            [[context]]
            name = "office"
            [[context.extension]]
            exten = "200"
            priority = 1
            app = "NoOp"
            "#,
        )
        .unwrap();
        assert_eq!(1, load(&engine, &smaller, "loader").unwrap());

        let names: Vec<String> = engine
            .registry()
            .contexts()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(vec!["office", "manual"], names);
        assert!(engine.exists(None, "office", "200", 1, None));
        assert!(!engine.exists(None, "office", "150", 1, None));
    }

    #[test]
    fn errors_leave_the_dialplan_alone() {
        let engine = Engine::new(Config::default());
        load(&engine, &DialplanFile::from_toml(DIALPLAN).unwrap(), "loader").unwrap();

        for broken in [
            "[[context]]\nname = \"a\"\n[[context]]\nname = \"a\"\n",
            "[[context]]\nname = \"a\"\n[[context.extension]]\nexten = \"1\"\npriority = \"x\"\n",
            "[[context]]\nname = \"a\"\n[[context.extension]]\nexten = \"1\"\npriority = 0\n",
            "[[context]]\nname = \"a\"\nincludes = [\"b,99:99\"]\n",
            concat!(
                "[[context]]\nname = \"a\"\n",
                "[[context.extension]]\nexten = \"1\"\npriority = 1\nlabel = \"x\"\n",
                "[[context.extension]]\nexten = \"1\"\npriority = 2\nlabel = \"x\"\n",
            ),
        ] {
            let file = DialplanFile::from_toml(broken).unwrap();
            assert!(load(&engine, &file, "loader").is_err(), "{broken}");
        }
        assert!(engine.exists(None, "office", "150", 1, None));
        assert!(engine.registry().find_context("a").is_none());
        assert!(DialplanFile::from_toml("[[context]]\n").is_err());
    }
}
