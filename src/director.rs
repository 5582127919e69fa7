//! The player pool: one current composition, the default composition that
//! fills the silence, and any number of samples on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::composition::{Catalog, Composition, SetList};
use crate::player::{CompositionPlayer, PlayState, PlayerContext, PlayerError, PlayerRole, PlayerSupervisor};

pub struct Director {
    catalog: Arc<Catalog>,
    context: PlayerContext,
    current: Arc<CompositionPlayer>,
    default_player: Arc<CompositionPlayer>,
    samples: Mutex<Vec<Arc<CompositionPlayer>>>,
    set_list: RwLock<Option<SetList>>,
    auto_select_next: AtomicBool,
    me: Weak<Director>,
}

impl Director {
    pub fn new(context: PlayerContext, catalog: Arc<Catalog>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Director>| {
            let supervisor: Weak<dyn PlayerSupervisor> = me.clone();
            Self {
                current: CompositionPlayer::new(
                    context.clone(),
                    PlayerRole::Current,
                    supervisor.clone(),
                ),
                default_player: CompositionPlayer::new(
                    context.clone(),
                    PlayerRole::Default,
                    supervisor,
                ),
                auto_select_next: AtomicBool::new(context.settings.auto_select_next),
                catalog,
                context,
                samples: Mutex::new(Vec::new()),
                set_list: RwLock::new(None),
                me: me.clone(),
            }
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn current_player(&self) -> &Arc<CompositionPlayer> {
        &self.current
    }

    pub fn default_player(&self) -> &Arc<CompositionPlayer> {
        &self.default_player
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn set_auto_select_next(&self, enabled: bool) {
        self.auto_select_next.store(enabled, Ordering::Relaxed);
    }

    /// Activates a set list and selects its first composition.
    pub fn load_set_list(&self, name: &str) -> Result<(), PlayerError> {
        let set_list = self
            .catalog
            .set_list(name)
            .ok_or_else(|| PlayerError::UnknownComposition(name.to_string()))?;
        let first = set_list.entries.first().map(|e| e.name.clone());
        tracing::info!(set_list = name, "Set list loaded");
        *self.set_list.write() = Some(set_list);
        match first {
            Some(first) => self.set_composition(&first),
            None => Ok(()),
        }
    }

    pub fn set_list(&self) -> Option<SetList> {
        self.set_list.read().clone()
    }

    /// Names the composition order selection moves through: the active set
    /// list, or every playable composition of the catalog.
    fn order(&self) -> Vec<String> {
        match &*self.set_list.read() {
            Some(set_list) => set_list.entries.iter().map(|e| e.name.clone()).collect(),
            None => self
                .catalog
                .playable()
                .iter()
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    fn neighbour(&self, step: isize) -> Option<String> {
        let order = self.order();
        let current = self.current.composition();
        let index = match current {
            Some(c) => order.iter().position(|n| *n == c.name)?,
            None if step > 0 => return order.first().cloned(),
            None => return None,
        };
        let next = index.checked_add_signed(step)?;
        order.get(next).cloned()
    }

    pub fn has_next_composition(&self) -> bool {
        self.neighbour(1).is_some()
    }

    fn prepare(&self, composition: &Composition) {
        composition.link_mappings(&self.context.settings.midi_mapping);
    }

    /// Selects a composition for the current player, stopping whatever it
    /// was playing.
    pub fn set_composition(&self, name: &str) -> Result<(), PlayerError> {
        let composition = self
            .catalog
            .get(name)
            .ok_or_else(|| PlayerError::UnknownComposition(name.to_string()))?;
        self.current.stop();
        self.prepare(&composition);
        self.current.set_composition(composition);
        tracing::info!(composition = name, "Composition selected");
        Ok(())
    }

    pub fn play(&self) -> Result<(), PlayerError> {
        if self.current.composition().is_none() {
            if let Some(first) = self.order().first().cloned() {
                self.set_composition(&first)?;
            }
        }
        self.stop_default_composition();
        self.current.play()
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        self.current.pause()
    }

    /// Stops the current composition and falls back to the default one.
    pub fn stop(&self) -> Result<(), PlayerError> {
        self.current.stop();
        self.play_default_composition()
    }

    pub fn seek(&self, position_millis: u64) -> Result<(), PlayerError> {
        self.current.seek(position_millis)
    }

    pub fn toggle_play(&self) -> Result<(), PlayerError> {
        if self.current.state() == PlayState::Playing {
            self.stop()
        } else {
            self.play()
        }
    }

    /// Selects the next composition. Returns false at the end of the order.
    pub fn next_composition(&self) -> Result<bool, PlayerError> {
        match self.neighbour(1) {
            Some(name) => self.set_composition(&name).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn previous_composition(&self) -> Result<bool, PlayerError> {
        match self.neighbour(-1) {
            Some(name) => self.set_composition(&name).map(|_| true),
            None => Ok(false),
        }
    }

    /// Plays the catalog's default composition unless the current one is
    /// running.
    pub fn play_default_composition(&self) -> Result<(), PlayerError> {
        if matches!(
            self.current.state(),
            PlayState::Playing | PlayState::Loading | PlayState::Loaded
        ) {
            return Ok(());
        }
        let Some(composition) = self.catalog.default_composition() else {
            return Ok(());
        };
        let same = self
            .default_player
            .composition()
            .is_some_and(|c| c.name == composition.name);
        if !same {
            self.default_player.stop();
            self.prepare(&composition);
            self.default_player.set_composition(composition);
        }
        tracing::debug!("Playing the default composition");
        self.default_player.play()
    }

    pub fn stop_default_composition(&self) {
        self.default_player.stop();
    }

    /// Plays a composition as a sample on top of everything else.
    pub fn play_sample(&self, name: &str) -> Result<(), PlayerError> {
        let composition = self
            .catalog
            .get(name)
            .ok_or_else(|| PlayerError::UnknownComposition(name.to_string()))?;
        self.prepare(&composition);
        let supervisor: Weak<dyn PlayerSupervisor> = self.me.clone();
        let player = CompositionPlayer::new(self.context.clone(), PlayerRole::Sample, supervisor);
        player.set_composition(composition);
        self.samples.lock().push(Arc::clone(&player));
        if let Err(e) = player.play() {
            self.sample_finished(&player);
            return Err(e);
        }
        Ok(())
    }

    pub fn sample_finished(&self, player: &Arc<CompositionPlayer>) {
        self.samples.lock().retain(|p| p.id() != player.id());
    }

    /// Decides what follows a composition that played to its end.
    fn finish(&self, player: &Arc<CompositionPlayer>) -> Result<(), PlayerError> {
        match player.role() {
            PlayerRole::Sample => {
                player.stop();
                self.sample_finished(player);
                return Ok(());
            }
            PlayerRole::Default => {
                player.stop();
                return Ok(());
            }
            PlayerRole::Current => {}
        }
        if player.state() != PlayState::Playing {
            return Ok(());
        }
        let auto_start_next = player.composition().is_some_and(|c| c.auto_start_next);

        if auto_start_next && self.has_next_composition() {
            self.current.stop();
            self.next_composition()?;
            self.current.play()
        } else if self.auto_select_next.load(Ordering::Relaxed) {
            self.current.stop();
            self.next_composition().map(|_| ())
        } else {
            self.current.stop();
            self.play_default_composition()?;
            self.next_composition().map(|_| ())
        }
    }
}

impl PlayerSupervisor for Director {
    fn auto_stop_fired(&self, player: &Arc<CompositionPlayer>) {
        if let Err(e) = self.finish(player) {
            tracing::error!(error = %e, "Could not apply the auto-stop policy");
        }
    }

    fn composition_finished(&self, player: &Arc<CompositionPlayer>) {
        if let Err(e) = self.finish(player) {
            tracing::error!(error = %e, "Could not finish the composition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::tests::audio;
    use crate::composition::{DurationProbe, CompositionFile, SetListEntry};
    use crate::player::tests::{harness, wait_for};
    use std::time::Duration;

    struct KeepDuration;

    impl DurationProbe for KeepDuration {
        fn duration_millis(&self, file: &CompositionFile) -> Option<u64> {
            Some(file.common().duration_millis)
        }
    }

    fn catalog() -> Arc<Catalog> {
        let catalog = Catalog::new(Arc::new(KeepDuration), 2);
        for (name, millis) in [("A", 60_000), ("B", 60_000), ("C", 60_000)] {
            catalog
                .save_composition(Composition::new(name, vec![audio("a.wav", 0, millis)]))
                .unwrap();
        }
        let mut default = Composition::new("Idle", vec![audio("idle.wav", 0, 60_000)]);
        default.default_composition = true;
        catalog.save_composition(default).unwrap();
        let mut sample = Composition::new("Horn", vec![audio("horn.wav", 0, 40)]);
        sample.sample = true;
        catalog.save_composition(sample).unwrap();
        Arc::new(catalog)
    }

    fn current_name(director: &Director) -> Option<String> {
        director.current_player().composition().map(|c| c.name.clone())
    }

    #[test]
    fn selection_walks_the_playable_compositions() {
        let h = harness();
        let director = Director::new(h.context.clone(), catalog());
        assert!(director.next_composition().unwrap());
        assert_eq!(current_name(&director).as_deref(), Some("A"));
        assert!(director.next_composition().unwrap());
        assert!(director.next_composition().unwrap());
        assert_eq!(current_name(&director).as_deref(), Some("C"));
        assert!(!director.next_composition().unwrap());
        assert!(director.previous_composition().unwrap());
        assert_eq!(current_name(&director).as_deref(), Some("B"));
    }

    #[test]
    fn set_list_defines_the_order() {
        let h = harness();
        let catalog = catalog();
        catalog
            .save_set_list(SetList {
                name: "Encore".into(),
                entries: ["C", "A"]
                    .iter()
                    .map(|n| SetListEntry {
                        name: n.to_string(),
                        duration_millis: 0,
                    })
                    .collect(),
                notes: String::new(),
            })
            .unwrap();
        let director = Director::new(h.context.clone(), catalog);
        director.load_set_list("Encore").unwrap();
        assert_eq!(current_name(&director).as_deref(), Some("C"));
        assert!(director.next_composition().unwrap());
        assert_eq!(current_name(&director).as_deref(), Some("A"));
        assert!(!director.has_next_composition());
    }

    #[test]
    fn stop_falls_back_to_the_default_composition() {
        let h = harness();
        let director = Director::new(h.context.clone(), catalog());
        director.set_composition("A").unwrap();
        director.play().unwrap();
        assert!(wait_for(|| director.current_player().state() == PlayState::Playing));

        director.stop().unwrap();
        assert_eq!(director.current_player().state(), PlayState::Stopped);
        assert!(wait_for(|| director.default_player().state() == PlayState::Playing));

        director.play().unwrap();
        assert_eq!(director.default_player().state(), PlayState::Stopped);
    }

    #[test]
    fn finished_composition_plays_default_and_selects_next() {
        let h = harness();
        let director = Director::new(h.context.clone(), catalog());
        director.set_composition("A").unwrap();
        director.play().unwrap();
        assert!(wait_for(|| director.current_player().state() == PlayState::Playing));

        director.composition_finished(director.current_player());
        assert_eq!(current_name(&director).as_deref(), Some("B"));
        assert_eq!(director.current_player().state(), PlayState::Stopped);
        assert!(wait_for(|| director.default_player().state() == PlayState::Playing));
    }

    #[test]
    fn auto_start_next_plays_the_following_composition() {
        let h = harness();
        let catalog = catalog();
        let mut first = Composition::new("A", vec![audio("a.wav", 0, 50)]);
        first.auto_start_next = true;
        catalog.save_composition(first).unwrap();
        let director = Director::new(h.context.clone(), catalog);
        director.set_composition("A").unwrap();
        director.play().unwrap();

        assert!(wait_for(|| current_name(&director).as_deref() == Some("B")));
        assert!(wait_for(|| director.current_player().state() == PlayState::Playing));
        assert_eq!(director.default_player().state(), PlayState::Stopped);
    }

    #[test]
    fn auto_select_next_only_moves_the_selection() {
        let h = harness();
        let director = Director::new(h.context.clone(), catalog());
        director.set_auto_select_next(true);
        director.set_composition("A").unwrap();
        director.play().unwrap();
        assert!(wait_for(|| director.current_player().state() == PlayState::Playing));

        director.auto_stop_fired(director.current_player());
        assert_eq!(current_name(&director).as_deref(), Some("B"));
        assert_eq!(director.current_player().state(), PlayState::Stopped);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(director.default_player().state(), PlayState::Stopped);
    }

    #[test]
    fn samples_leave_the_pool_when_done() {
        let h = harness();
        let director = Director::new(h.context.clone(), catalog());
        director.play_sample("Horn").unwrap();
        assert_eq!(director.sample_count(), 1);
        assert!(wait_for(|| director.sample_count() == 0));
        assert!(matches!(
            director.play_sample("Missing"),
            Err(PlayerError::UnknownComposition(_))
        ));
    }
}
