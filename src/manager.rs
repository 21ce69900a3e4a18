//! Create, remove and control services on the selected init system.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::artifact::GeneratedService;
use crate::config::Settings;
use crate::descriptor::ServiceDescriptor;
use crate::detect::{self, Selection};
use crate::error::{Result, ServError};
use crate::host::Host;
use crate::init::{InitSystem, InitSystemKind, Transition};
use crate::status::StatusRecord;
use crate::template::TemplateEngine;

/// What `create` does after rendering the artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub overwrite: bool,
    pub deploy: bool,
    pub start: bool,
}

pub struct ServiceManager {
    host: Host,
    settings: Settings,
    engine: TemplateEngine,
    selection: Selection,
}

impl ServiceManager {
    /// Select the init system for `host` and load the templates.
    pub fn new(
        host: Host,
        settings: Settings,
        choice: Option<InitSystemKind>,
        version: Option<&str>,
    ) -> Result<Self> {
        let engine = match &settings.paths.templates {
            Some(dir) => TemplateEngine::with_overrides(dir)?,
            None => TemplateEngine::builtin()?,
        };
        let selection = detect::select(&host, choice, version)?;
        Ok(Self {
            host,
            settings,
            engine,
            selection,
        })
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub fn adapter(&self) -> Box<dyn InitSystem> {
        self.selection.create(&self.host, &self.settings)
    }

    /// Render the service files and optionally deploy, install and start them.
    pub fn create(
        &self,
        descriptor: &ServiceDescriptor,
        options: CreateOptions,
    ) -> Result<GeneratedService> {
        if options.start && !options.deploy {
            return Err(ServError::invalid(
                "start",
                "a service cannot be started without deploying it",
            ));
        }

        let init = self.adapter();
        let name = descriptor.name();
        info!(init_system = %init.kind(), service = %name, "Generating service files");
        let generated = init.generate(descriptor, &self.engine, options.overwrite)?;
        for path in generated.paths() {
            info!(path = %path.display(), "Generated");
        }

        if !options.deploy {
            return Ok(generated);
        }

        init.validate_platform()?;
        if !init.is_present() {
            return Err(ServError::unavailable(
                init.kind().name(),
                "not installed on this system",
            ));
        }

        info!(service = %name, "Deploying");
        init.deploy(&generated, options.overwrite)?;
        init.install(name)?;

        if options.start {
            init.start(name)?;
        }
        info!(service = %name, "Service created");
        Ok(generated)
    }

    /// Stop and uninstall a registered service.
    pub fn remove(&self, name: &str) -> Result<()> {
        let init = self.registered(name)?;
        info!(init_system = %init.kind(), service = %name, "Removing service");

        if let Err(e) = init.stop(name) {
            warn!(service = %name, error = %e, "Stop failed, uninstalling anyway");
        }
        init.uninstall(name)?;

        if init.is_registered(name)? {
            warn!(service = %name, "Service files still present after uninstall");
        } else {
            info!(service = %name, "Service removed");
        }
        Ok(())
    }

    /// Status of one registered service, or of everything the init system knows.
    pub fn status(&self, name: Option<&str>) -> Result<StatusRecord> {
        let init = match name {
            Some(name) => self.registered(name)?,
            None => self.adapter(),
        };
        init.status(name)
    }

    pub fn start(&self, name: &str) -> Result<Transition> {
        self.registered(name)?.start(name)
    }

    pub fn stop(&self, name: &str) -> Result<Transition> {
        self.registered(name)?.stop(name)
    }

    /// Stop, wait `restart_delay_seconds`, start.
    pub fn restart(&self, name: &str) -> Result<Transition> {
        let init = self.registered(name)?;
        init.stop(name)?;
        if self.settings.restart_delay_seconds > 0 {
            thread::sleep(Duration::from_secs(self.settings.restart_delay_seconds));
        }
        init.start(name)
    }

    fn registered(&self, name: &str) -> Result<Box<dyn InitSystem>> {
        let init = self.adapter();
        init.validate_platform()?;
        if !init.is_registered(name)? {
            return Err(ServError::ServiceNotRegistered {
                name: name.to_string(),
            });
        }
        Ok(init)
    }
}
