use ltv_pdf::{parse_revisions, RevisionKind};

fn main() {
    env_logger::init();

    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        eprintln!("usage: ltv_pdf <file.pdf>...");
        std::process::exit(2);
    }

    for file in files {
        println!("processing {}", file);
        let pdf_bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("{file}: {e}");
                continue;
            }
        };
        let report = match parse_revisions(&pdf_bytes) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("{file}: {e}");
                continue;
            }
        };

        for (i, revision) in report.revisions.iter().enumerate() {
            let kind = match revision.kind {
                RevisionKind::Signature => "signature",
                RevisionKind::DocumentTimestamp { archive: true } => "archive timestamp",
                RevisionKind::DocumentTimestamp { archive: false } => "document timestamp",
            };
            println!(
                "  #{i} {kind} {:?} byte range {:?}, VRI {}{}",
                revision.field_names,
                revision.byte_range.0,
                revision.vri_key(),
                if revision.covers_whole_document {
                    ", covers the whole file"
                } else {
                    ""
                }
            );
        }
        for excluded in &report.excluded {
            println!("  excluded {:?}: {}", excluded.field_names, excluded.reason);
        }
        println!("  DSS: {}", if report.has_dss { "present" } else { "absent" });
    }
}
