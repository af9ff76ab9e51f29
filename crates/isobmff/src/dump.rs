//! Human-readable box-tree dump, used by the CLI `boxes` command.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;

use demux::{ByteSource, Result};

use crate::boxes::{self, BOX_SIZE_CEILING, BoxWalker};
use crate::fourcc::is_container;

/// Walk the top-level boxes of `source` and print an indented tree.
///
/// Media-data payloads are skipped; structural boxes are loaded and
/// descended into.
pub fn dump_boxes(source: &Arc<dyn ByteSource>, out: &mut dyn Write) -> Result<()> {
    let mut offset = 0u64;
    loop {
        let Some(header) = boxes::read_header_at(source.as_ref(), offset)? else {
            return Ok(());
        };

        writeln!(out, "{} ({} bytes)", header.fourcc, header.size)
            .map_err(demux::DemuxError::Io)?;

        let descend = is_container(header.fourcc)
            && !header.extends_to_end()
            && header.payload_len() <= BOX_SIZE_CEILING;
        if descend {
            let payload = boxes::load_payload(source.as_ref(), offset, &header)?;
            dump_children(&payload, out, 1)?;
        }

        if header.extends_to_end() {
            return Ok(());
        }
        if header.size < header.header_len {
            return Ok(());
        }
        offset += header.size;
    }
}

fn dump_children(data: &Bytes, out: &mut dyn Write, depth: usize) -> Result<()> {
    for child in BoxWalker::over(data) {
        // A dump keeps going on malformed children rather than failing.
        let Ok(child) = child else { return Ok(()) };
        writeln!(
            out,
            "{}{} ({} bytes)",
            "  ".repeat(depth),
            child.fourcc,
            child.end - child.start
        )
        .map_err(demux::DemuxError::Io)?;

        if is_container(child.fourcc) {
            let body = data.slice(child.body_start..child.body_end);
            dump_children(&body, out, depth + 1)?;
        }
    }
    Ok(())
}
