//! Item-oriented step execution
//!
//! Reads items one at a time, passes each through the optional processor and
//! hands the survivors to the writer once `item_count` items were read. Every
//! chunk ends at a checkpoint boundary where the stop signal is observed,
//! checkpoints are captured and the record is saved unless stopping.

use crate::context::UnitContext;
use crate::metrics::CHUNKS_TOTAL;
use crate::{Error, Result};
use jobline_core::{ArtifactRole, BatchStatus, ItemProcessor, ItemReader, ItemWriter, MetricType, StepKind};
use tracing::{debug, info, warn};

struct Collaborators<'a> {
    reader_name: &'a str,
    processor_name: Option<&'a str>,
    writer_name: &'a str,
    reader: Box<dyn ItemReader>,
    processor: Option<Box<dyn ItemProcessor>>,
    writer: Box<dyn ItemWriter>,
}

/// Run the chunk loop of the unit's step until the reader is exhausted, a
/// collaborator fails or a stop is observed.
///
/// Reader and writer are closed on every exit once opened.
pub async fn run_chunk<C: UnitContext>(ctx: &C) -> Result<()> {
    let step = ctx.step();
    let StepKind::Chunk {
        reader,
        processor,
        writer,
        item_count,
    } = &step.kind
    else {
        return Err(Error::Execution(format!("step {} is not a chunk step", step.id)));
    };

    let factory = ctx.job_context().factory();
    let mut parts = Collaborators {
        reader_name: reader,
        processor_name: processor.as_deref(),
        writer_name: writer,
        reader: factory.item_reader(reader, &step.properties)?,
        processor: match processor.as_deref() {
            Some(name) => Some(factory.item_processor(name, &step.properties)?),
            None => None,
        },
        writer: factory.item_writer(writer, &step.properties)?,
    };
    let item_count = item_count
        .unwrap_or(ctx.job_context().config().default_item_count)
        .max(1);

    let reader_checkpoint = ctx.cell().reader_checkpoint();
    parts
        .reader
        .open(ctx, reader_checkpoint.as_ref())
        .await
        .map_err(|e| Error::collaborator(ArtifactRole::ItemReader, parts.reader_name, "open", e))?;

    let writer_checkpoint = ctx.cell().writer_checkpoint();
    if let Err(e) = parts.writer.open(ctx, writer_checkpoint.as_ref()).await {
        if let Err(close_err) = parts.reader.close().await {
            warn!(reader = %parts.reader_name, error = %close_err, "Failed to close reader");
        }
        return Err(Error::collaborator(ArtifactRole::ItemWriter, parts.writer_name, "open", e));
    }

    let result = chunk_loop(ctx, &mut parts, item_count).await;
    if result.is_err() {
        ctx.cell().update_metrics(|m| m.increment(MetricType::RollbackCount, 1));
    }

    let reader_closed = parts
        .reader
        .close()
        .await
        .map_err(|e| Error::collaborator(ArtifactRole::ItemReader, parts.reader_name, "close", e));
    let writer_closed = parts
        .writer
        .close()
        .await
        .map_err(|e| Error::collaborator(ArtifactRole::ItemWriter, parts.writer_name, "close", e));

    match result {
        Ok(()) => reader_closed.and(writer_closed),
        Err(e) => {
            for closed in [reader_closed, writer_closed] {
                if let Err(close_err) = closed {
                    warn!(step = %step.id, error = %close_err, "Close failed after chunk failure");
                }
            }
            Err(e)
        }
    }
}

async fn chunk_loop<C: UnitContext>(ctx: &C, parts: &mut Collaborators<'_>, item_count: usize) -> Result<()> {
    let step_name = ctx.step().id.as_str();

    loop {
        if ctx.cancel_token().is_cancelled() {
            info!(step = %step_name, partition = ?ctx.cell().partition_id(), "Stop observed at checkpoint boundary");
            ctx.cell().set_batch_status(BatchStatus::Stopping);
            return Ok(());
        }

        let mut read = 0u64;
        let mut filtered = 0u64;
        let mut exhausted = false;
        let mut items = Vec::with_capacity(item_count);

        while (read as usize) < item_count {
            let item = parts
                .reader
                .read_item()
                .await
                .map_err(|e| Error::collaborator(ArtifactRole::ItemReader, parts.reader_name, "read_item", e))?;
            let Some(item) = item else {
                exhausted = true;
                break;
            };
            read += 1;

            let processed = match (parts.processor.as_mut(), parts.processor_name) {
                (Some(processor), Some(name)) => processor
                    .process_item(item)
                    .await
                    .map_err(|e| Error::collaborator(ArtifactRole::ItemProcessor, name, "process_item", e))?,
                _ => Some(item),
            };
            match processed {
                Some(item) => items.push(item),
                None => filtered += 1,
            }
        }

        if read == 0 && exhausted {
            debug!(step = %step_name, "Reader exhausted");
            return Ok(());
        }

        let written = items.len() as u64;
        if !items.is_empty() {
            parts
                .writer
                .write_items(items)
                .await
                .map_err(|e| Error::collaborator(ArtifactRole::ItemWriter, parts.writer_name, "write_items", e))?;
        }

        ctx.cell().update_metrics(|m| {
            m.increment(MetricType::ReadCount, read);
            m.increment(MetricType::WriteCount, written);
            m.increment(MetricType::FilterCount, filtered);
            m.increment(MetricType::CommitCount, 1);
        });

        let reader_checkpoint = parts
            .reader
            .checkpoint_info(ctx)
            .await
            .map_err(|e| Error::collaborator(ArtifactRole::ItemReader, parts.reader_name, "checkpoint_info", e))?;
        let writer_checkpoint = parts
            .writer
            .checkpoint_info(ctx)
            .await
            .map_err(|e| Error::collaborator(ArtifactRole::ItemWriter, parts.writer_name, "checkpoint_info", e))?;
        ctx.cell().set_checkpoints(reader_checkpoint, writer_checkpoint);

        ctx.collect().await?;

        let persisted = ctx.save(false).await?;
        CHUNKS_TOTAL
            .with_label_values(&[if persisted { "true" } else { "false" }])
            .inc();
        debug!(
            step = %step_name,
            partition = ?ctx.cell().partition_id(),
            read,
            written,
            filtered,
            persisted,
            "Chunk committed"
        );

        if exhausted {
            return Ok(());
        }
    }
}
