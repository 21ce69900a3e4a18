//! Tera template engine wrapper.
//!
//! Artifact templates ship inside the binary. An override directory can
//! replace any of them by name; templates it does not provide fall back to
//! the built-in copy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tera::{Context, Tera, Value};
use tracing::{debug, info};

use crate::error::{Result, ServError};

/// Built-in templates, named `<init system>_<version><suffix>`.
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "systemd_default.service",
        include_str!("../templates/systemd_default.service"),
    ),
    ("systemd_default", include_str!("../templates/systemd_default")),
    ("upstart_1.5.conf", include_str!("../templates/upstart_1.5.conf")),
    (
        "upstart_default.conf",
        include_str!("../templates/upstart_default.conf"),
    ),
    ("sysv_lsb-3.1", include_str!("../templates/sysv_lsb-3.1")),
    (
        "sysv_lsb-3.1.defaults",
        include_str!("../templates/sysv_lsb-3.1.defaults"),
    ),
    ("nssm_default.bat", include_str!("../templates/nssm_default.bat")),
    (
        "supervisor_default.conf",
        include_str!("../templates/supervisor_default.conf"),
    ),
    ("runit_default.run", include_str!("../templates/runit_default.run")),
];

/// Renders artifact templates.
#[derive(Clone)]
pub struct TemplateEngine {
    tera: Arc<Tera>,
}

impl TemplateEngine {
    /// Engine holding only the built-in templates.
    pub fn builtin() -> Result<Self> {
        let tera = builtin_tera()?;
        Ok(Self {
            tera: Arc::new(tera),
        })
    }

    /// Engine whose templates in `template_dir` take precedence over the built-in ones.
    pub fn with_overrides(template_dir: &Path) -> Result<Self> {
        let pattern = template_dir.join("**/*");
        let pattern_str = pattern.to_string_lossy();

        debug!(pattern = %pattern_str, "Loading template overrides");

        let mut tera = Tera::new(&pattern_str).map_err(|e| ServError::TemplateRender {
            template: pattern_str.to_string(),
            message: describe(&e),
        })?;
        register_filters(&mut tera);
        let overrides = tera.get_template_names().count();

        // extend() keeps templates that already exist, so overrides win
        tera.extend(&builtin_tera()?)
            .map_err(|e| ServError::TemplateRender {
                template: pattern_str.to_string(),
                message: describe(&e),
            })?;

        info!(
            directory = %template_dir.display(),
            overrides,
            "Template overrides loaded"
        );

        Ok(Self {
            tera: Arc::new(tera),
        })
    }

    /// Render `template_name` with a JSON object as context.
    pub fn render(&self, template_name: &str, context: &serde_json::Value) -> Result<String> {
        let tera_context =
            Context::from_serialize(context).map_err(|e| ServError::TemplateRender {
                template: template_name.to_string(),
                message: format!("invalid template context: {}", describe(&e)),
            })?;

        self.tera
            .render(template_name, &tera_context)
            .map_err(|e| ServError::TemplateRender {
                template: template_name.to_string(),
                message: describe(&e),
            })
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.tera.get_template_names().any(|n| n == name)
    }

    pub fn list_templates(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tera.get_template_names().collect();
        names.sort_unstable();
        names
    }
}

fn builtin_tera() -> Result<Tera> {
    let mut tera = Tera::default();
    tera.add_raw_templates(BUILTIN_TEMPLATES.iter().copied())
        .map_err(|e| ServError::TemplateRender {
            template: "<builtin>".to_string(),
            message: describe(&e),
        })?;
    register_filters(&mut tera);
    Ok(tera)
}

/// `shell_quote` wraps a value in single quotes for `sh`; `escape_quotes`
/// backslash-escapes it for use inside double quotes.
fn register_filters(tera: &mut Tera) {
    tera.register_filter("shell_quote", shell_quote);
    tera.register_filter("escape_quotes", escape_quotes);
}

fn filter_input<'a>(filter: &str, value: &'a Value) -> tera::Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| tera::Error::msg(format!("{} expects a string", filter)))
}

fn shell_quote(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = filter_input("shell_quote", value)?;
    Ok(Value::String(format!("'{}'", raw.replace('\'', "'\\''"))))
}

fn escape_quotes(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = filter_input("escape_quotes", value)?;
    Ok(Value::String(raw.replace('\\', "\\\\").replace('"', "\\\"")))
}

/// Tera keeps the useful detail in the error's source chain.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
