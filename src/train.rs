use crate::checkpoint;
use crate::data::cifar10::DataLoader;
use crate::loss::{accuracy, accuracy_topk, cross_entropy_loss};
use crate::nn::Module;
use crate::optim::{LRScheduler, Optimizer};
use crate::Tape;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Instant;

/// Training metrics tracking
#[derive(Clone, Default)]
pub struct Metrics {
    pub train_loss: Vec<f32>,
    pub train_acc: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_acc: Vec<f32>,
    pub val_acc5: Vec<f32>,
    pub epoch_times: Vec<f32>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print_last(&self) {
        if let (Some(train_loss), Some(train_acc), Some(val_loss), Some(val_acc), Some(val_acc5)) = (
            self.train_loss.last(),
            self.train_acc.last(),
            self.val_loss.last(),
            self.val_acc.last(),
            self.val_acc5.last(),
        ) {
            println!(
                "Train Loss: {:.4} | Train Acc: {:.2}% | Val Loss: {:.4} | Val Acc@1: {:.2}% | Val Acc@5: {:.2}%",
                train_loss,
                train_acc * 100.0,
                val_loss,
                val_acc * 100.0,
                val_acc5 * 100.0
            );
        }
    }

    pub fn summary(&self) {
        println!("\nTraining Summary:");
        println!("{}", "=".repeat(50));

        if !self.train_acc.is_empty() {
            let best_train_acc = self.train_acc.iter().copied().fold(0.0f32, f32::max);
            let best_val_acc = self.val_acc.iter().copied().fold(0.0f32, f32::max);
            let final_train_acc = self.train_acc.last().unwrap();
            let final_val_acc = self.val_acc.last().unwrap();

            println!("Best Train Accuracy: {:.2}%", best_train_acc * 100.0);
            println!("Best Val Accuracy@1: {:.2}%", best_val_acc * 100.0);
            println!("Final Train Accuracy: {:.2}%", final_train_acc * 100.0);
            println!("Final Val Accuracy@1: {:.2}%", final_val_acc * 100.0);

            if !self.epoch_times.is_empty() {
                let total_time: f32 = self.epoch_times.iter().sum();
                let avg_time = total_time / self.epoch_times.len() as f32;
                println!("Total Training Time: {:.2}s", total_time);
                println!("Average Epoch Time: {:.2}s", avg_time);
            }
        }

        println!("{}", "=".repeat(50));
    }
}

/// Drives the epoch loop. Only the parameters the model exposes are
/// updated, so for a scaled network the frozen signs never move.
pub struct Trainer {
    pub model: Box<dyn Module>,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Option<Box<dyn LRScheduler>>,
    pub metrics: Metrics,
}

impl Trainer {
    pub fn new(
        model: Box<dyn Module>,
        optimizer: Box<dyn Optimizer>,
        scheduler: Option<Box<dyn LRScheduler>>,
    ) -> Self {
        Trainer {
            model,
            optimizer,
            scheduler,
            metrics: Metrics::new(),
        }
    }

    /// Train for one epoch
    pub fn train_epoch(&mut self, dataloader: &mut DataLoader) -> (f32, f32) {
        self.model.set_training(true);

        let mut total_loss = 0.0;
        let mut total_correct = 0;
        let mut total_samples = 0;

        dataloader.reset();
        let num_batches = dataloader.num_batches();

        for (batch_idx, (images, labels)) in dataloader.enumerate() {
            // Reset tape for new computation graph
            Tape::reset();

            let logits = self.model.forward(&images);
            let loss = cross_entropy_loss(&logits, &labels);

            let acc = accuracy(&logits, &labels);
            let batch_size = images.shape()[0];
            total_correct += (acc * batch_size as f32).round() as usize;
            total_samples += batch_size;

            loss.backward();

            self.optimizer.step();
            self.optimizer.zero_grad();

            total_loss += loss.data()[0];

            if batch_idx % 10 == 0 {
                print!(
                    "\rBatch [{}/{}] Loss: {:.4}",
                    batch_idx + 1,
                    num_batches,
                    loss.data()[0]
                );
                use std::io::Write;
                std::io::stdout().flush().ok();
            }
        }
        println!();

        let avg_loss = total_loss / num_batches as f32;
        let avg_acc = total_correct as f32 / total_samples as f32;

        (avg_loss, avg_acc)
    }

    /// Evaluate on the validation/test set; returns (loss, acc@1, acc@5).
    pub fn evaluate(&self, dataloader: &mut DataLoader) -> (f32, f32, f32) {
        self.model.set_training(false);

        let mut total_loss = 0.0;
        let mut total_correct = 0;
        let mut total_correct5 = 0;
        let mut total_samples = 0;

        dataloader.reset();
        let num_batches = dataloader.num_batches();

        for (images, labels) in dataloader {
            Tape::reset();

            let logits = self.model.forward(&images);
            let loss = cross_entropy_loss(&logits, &labels);

            let batch_size = images.shape()[0];
            total_correct += (accuracy(&logits, &labels) * batch_size as f32).round() as usize;
            total_correct5 +=
                (accuracy_topk(&logits, &labels, 5) * batch_size as f32).round() as usize;
            total_samples += batch_size;

            total_loss += loss.data()[0];
        }

        (
            total_loss / num_batches as f32,
            total_correct as f32 / total_samples as f32,
            total_correct5 as f32 / total_samples as f32,
        )
    }

    /// Main training loop. When `save` is given, the latest state is
    /// written each epoch and the best-accuracy state to `<save>.best`.
    pub fn fit(
        &mut self,
        train_loader: &mut DataLoader,
        val_loader: &mut DataLoader,
        epochs: usize,
        save: Option<&Path>,
    ) {
        println!("Starting training for {} epochs", epochs);
        println!("{}", "=".repeat(60));

        let pb = ProgressBar::new(epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut best_acc = 0.0f32;

        for epoch in 0..epochs {
            let epoch_start = Instant::now();

            println!("\nEpoch {}/{}", epoch + 1, epochs);

            let (train_loss, train_acc) = self.train_epoch(train_loader);
            let (val_loss, val_acc, val_acc5) = self.evaluate(val_loader);

            if let Some(scheduler) = &mut self.scheduler {
                scheduler.step();
                self.optimizer.set_lr(scheduler.get_lr());
            }

            self.metrics.train_loss.push(train_loss);
            self.metrics.train_acc.push(train_acc);
            self.metrics.val_loss.push(val_loss);
            self.metrics.val_acc.push(val_acc);
            self.metrics.val_acc5.push(val_acc5);
            self.metrics
                .epoch_times
                .push(epoch_start.elapsed().as_secs_f32());

            self.metrics.print_last();
            if let Some(scheduler) = &self.scheduler {
                println!("   Learning Rate: {:.6}", scheduler.get_lr());
            }

            if let Some(path) = save {
                let mut state = Vec::new();
                self.model.state("", &mut state);
                if let Err(e) = checkpoint::save_state(path, &state) {
                    println!("Failed to save checkpoint {:?}: {}", path, e);
                }
                if val_acc > best_acc {
                    best_acc = val_acc;
                    let best = path.with_extension("best");
                    if let Err(e) = checkpoint::save_state(&best, &state) {
                        println!("Failed to save checkpoint {:?}: {}", best, e);
                    }
                }
            }

            pb.inc(1);
        }

        pb.finish_with_message("Training complete");
        self.metrics.summary();
    }
}
