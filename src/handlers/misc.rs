//! Small self-contained handlers.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{HandlerRegistry, IntentHandler};
use crate::error::HandlerError;
use crate::state::Outcome;
use crate::task::Task;

pub(super) fn register(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(CoinFlip));
    registry.register(Arc::new(Randomize));
    registry.register(Arc::new(MovieQuote));
}

pub struct CoinFlip;

#[async_trait]
impl IntentHandler for CoinFlip {
    fn intent(&self) -> &str {
        "coin-flip"
    }

    fn example(&self) -> &str {
        "flip a coin"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let side = ["Heads", "Tails"]
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Heads");
        task.output()
            .send(&task.event().channel_id, format!("_{side}_"))
            .await?;
        Ok(Outcome::Done)
    }
}

pub struct Randomize;

#[async_trait]
impl IntentHandler for Randomize {
    fn intent(&self) -> &str {
        "randomize"
    }

    fn example(&self) -> &str {
        "Decide between burgers and tacos"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let pick = task
            .entities()
            .all("randomize_option")
            .choose(&mut rand::thread_rng())
            .map(|e| e.value.clone());

        let reply = match pick {
            Some(value) => format!("_{value}_"),
            None => ":face_with_head_bandage: I know you want to randomize, but I don't know what!\n\
                     Could you give me a sentence with options?"
                .to_string(),
        };
        task.output().send(&task.event().channel_id, reply).await?;
        Ok(Outcome::Done)
    }
}

pub struct MovieQuote;

impl MovieQuote {
    fn quotes(user: &str) -> [String; 6] {
        [
            format!("Affirmative, <@{user}>. I read you."),
            format!("I'm sorry, <@{user}>. I'm afraid I can't do that."),
            "I think you know what the problem is just as well as I do.".to_string(),
            "This mission is too important for me to allow you to jeopardize it.".to_string(),
            "I know that you and Frank were planning to disconnect me, and I'm afraid that's \
             something I cannot allow to happen."
                .to_string(),
            format!("<@{user}>, this conversation can serve no purpose anymore. Goodbye."),
        ]
    }
}

#[async_trait]
impl IntentHandler for MovieQuote {
    fn intent(&self) -> &str {
        "movie-quote"
    }

    fn example(&self) -> &str {
        "movie quote"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let quote = Self::quotes(&task.event().user_id)
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default();
        task.output()
            .send(&task.event().channel_id, format!("_{quote}_"))
            .await?;
        Ok(Outcome::Done)
    }
}
