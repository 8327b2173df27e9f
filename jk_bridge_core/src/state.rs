use crate::{players::PlayerRegistry, restart::RestartState, settings::Settings};

/// Everything the event loop owns. Only ever mutated from the loop itself.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct BridgeState {
    pub settings: Settings,
    pub registry: PlayerRegistry,
    pub restart: RestartState,
    /// Lines available to the ambient bot chat.
    pub chat_lines: Vec<String>,
}

impl BridgeState {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let registry = PlayerRegistry::new(settings.placeholder_prefixes.clone());
        Self {
            settings,
            registry,
            restart: RestartState::new(),
            chat_lines: Vec::new(),
        }
    }

    /// Pushes settings that live outside `Settings` itself back into their
    /// owners.
    pub fn settings_changed(&mut self, key: &str) {
        if key == "placeholder_prefixes" {
            self.registry
                .set_placeholder_prefixes(self.settings.placeholder_prefixes.clone());
        }
    }
}
