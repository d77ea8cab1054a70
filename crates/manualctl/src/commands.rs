//! Command implementations for manualctl.

use anyhow::{bail, Result};
use manual_shared::api::FeedbackRequest;
use manual_shared::error::format_remaining;
use manual_shared::{EventKind, Role, StreamEvent};
use std::io::{self, Write};

use crate::client::{EventDecoder, ManualClient};

pub async fn ask(
    client: &ManualClient,
    product: &str,
    question: &str,
    session: Option<String>,
) -> Result<()> {
    let mut response = client.ask(product, question, session).await?;
    let mut decoder = EventDecoder::default();
    let mut terminal: Option<StreamEvent> = None;

    while let Some(chunk) = response.chunk().await? {
        for event in decoder.push(&chunk)? {
            eprintln!("{}", event.format_debug());
            io::stderr().flush()?;
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
    }
    if decoder.has_partial() {
        eprintln!("(stream ended mid-event)");
    }

    let Some(event) = terminal else {
        bail!("Stream ended without an answer");
    };
    match event.kind() {
        Some(EventKind::Answer) => {
            print_answer(&event);
            Ok(())
        }
        _ => bail!(
            "{} ({})",
            event.error.as_deref().unwrap_or("Request failed"),
            event.code.as_deref().unwrap_or("INTERNAL_ERROR")
        ),
    }
}

fn print_answer(event: &StreamEvent) {
    println!();
    println!("{}", event.answer.as_deref().unwrap_or_default());
    println!();
    let source = event.source.map(|s| s.as_str()).unwrap_or("none");
    match &event.reference {
        Some(reference) => println!("source: {} ({})", source, reference),
        None => println!("source: {}", source),
    }
    if event.used_general_knowledge == Some(true) {
        println!("note: not found in the manual, answered from general knowledge");
    }
    if event.needs_verification == Some(true) {
        println!("note: low confidence, please double-check this answer");
    }
    if let Some(session_id) = &event.session_id {
        println!("session: {}", session_id);
    }
}

pub async fn feedback(
    client: &ManualClient,
    product: &str,
    question: String,
    answer: String,
    is_helpful: bool,
    correction: Option<String>,
) -> Result<()> {
    let response = client
        .feedback(
            product,
            &FeedbackRequest {
                question,
                answer,
                is_helpful,
                correction,
            },
        )
        .await?;
    if response.retired {
        println!("Thanks. That stored answer has been withdrawn.");
    } else {
        println!("Thanks for the feedback.");
    }
    Ok(())
}

pub async fn reset(client: &ManualClient, product: &str) -> Result<()> {
    let response = client.reset(product).await?;
    println!("New session: {}", response.session.id);
    Ok(())
}

pub async fn history(client: &ManualClient, session: &str, limit: Option<usize>) -> Result<()> {
    let response = client.history(session, limit).await?;
    if response.messages.is_empty() {
        println!("No messages in {}", response.session_id);
        return Ok(());
    }
    for message in &response.messages {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "manual",
        };
        println!(
            "[{}] {:>6}: {}",
            message.created_at.format("%Y-%m-%d %H:%M"),
            who,
            message.content
        );
    }
    Ok(())
}

pub async fn status(client: &ManualClient) -> Result<()> {
    let health = client.health().await?;
    println!(
        "manuald {} {} (up {})",
        health.version,
        health.status,
        format_remaining(health.uptime_seconds as i64)
    );

    let restriction = client.restriction().await?;
    if restriction.blocked {
        println!(
            "questions paused for {} ({} violations)",
            format_remaining(restriction.remaining_secs.unwrap_or_default()),
            restriction.violation_count.unwrap_or_default()
        );
    } else {
        println!("questions allowed");
    }
    Ok(())
}
