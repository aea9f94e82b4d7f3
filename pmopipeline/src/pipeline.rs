//! Façade d'agrégation : un pipeline possède ses stages et son bus
//!
//! Le [`Pipeline`] applique les transitions de lifecycle à l'ensemble des
//! stages insérés et possède le [`MessageBus`](crate::MessageBus) sur
//! lequel ils publient leurs erreurs. Le graphe lui-même (liens entre
//! ports) se construit avec [`Stage::link`](crate::Stage::link) avant
//! l'activation.

use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::events::MessageBus;
use crate::stage::{Stage, StageStatus};

struct PipelineInner {
    status: StageStatus,
    stages: Vec<Stage>,
}

/// Agrégat de stages partageant un bus de messages
///
/// L'horloge du pipeline vient du premier stage qui expose un
/// [`ClockProvider`](crate::ClockProvider) (le backend terminal).
pub struct Pipeline {
    inner: Mutex<PipelineInner>,
    bus: MessageBus,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            inner: Mutex::new(PipelineInner {
                status: StageStatus::Deactivated,
                stages: Vec::new(),
            }),
            bus: MessageBus::new(),
        }
    }

    /// Bus de messages du pipeline
    pub fn message_bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Insère un stage ; l'ordre d'insertion est l'ordre des transitions
    pub fn add_stage(&self, stage: Stage) {
        let mut inner = self.inner.lock().unwrap();
        inner.stages.push(stage);
    }

    /// Nombre de stages insérés
    pub fn stage_count(&self) -> usize {
        self.inner.lock().unwrap().stages.len()
    }

    /// Active tous les stages et démarre le bus
    ///
    /// Si un stage refuse l'activation, ceux déjà activés sont désactivés
    /// et la méthode retourne `false`.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.status != StageStatus::Deactivated {
            warn!("the pipeline has already been activated");
            return false;
        }

        self.bus.start();

        for index in 0..inner.stages.len() {
            if let Err(err) = inner.stages[index].activate(Some(&self.bus)) {
                error!(
                    stage = inner.stages[index].name(),
                    %err,
                    "stage failed to activate"
                );
                for stage in &inner.stages[..index] {
                    stage.deactivate();
                }
                self.bus.stop();
                return false;
            }
        }

        inner.status = StageStatus::Activated;
        true
    }

    /// Passe tous les stages en lecture
    ///
    /// Le provider d'horloge est pris sur le premier stage qui en expose
    /// un ; sans provider, échec.
    pub fn play(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.status != StageStatus::Activated {
            warn!("the pipeline is not activated");
            return false;
        }

        let Some(provider) = inner
            .stages
            .iter()
            .find_map(|stage| stage.clock_provider())
        else {
            error!("could not acquire a clock provider for the pipeline");
            return false;
        };

        for stage in &inner.stages {
            if let Err(err) = stage.play(&provider) {
                error!(stage = stage.name(), %err, "stage failed to play");
            }
        }

        inner.status = StageStatus::Playing;
        info!("pipeline playing");
        true
    }

    /// Arrête la lecture de tous les stages
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.status != StageStatus::Playing {
            warn!("the pipeline is not playing");
            return false;
        }

        for stage in &inner.stages {
            stage.stop();
        }

        inner.status = StageStatus::Activated;
        info!("pipeline stopped");
        true
    }

    /// Désactive tous les stages et arrête le bus
    pub fn deactivate(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.status == StageStatus::Deactivated {
            return false;
        }

        if inner.status == StageStatus::Playing {
            for stage in &inner.stages {
                stage.stop();
            }
            inner.status = StageStatus::Activated;
        }

        for stage in &inner.stages {
            stage.deactivate();
        }

        self.bus.stop();
        inner.status = StageStatus::Deactivated;
        true
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.deactivate();
    }
}

// ============================================================================
// Tests
// ============================================================================
