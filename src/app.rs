use crate::config::Settings;
use crate::engine::{JobHandle, Session};
use crate::error::Error;
use crate::interrupt;
use crate::job::JobDescriptor;
use crate::poll::{LoopState, PollLoop};
use crate::swarm::SwarmSession;
use std::io::{self, Write};
use tokio_util::sync::CancellationToken;

/// Adds `job` to `session` and shows its dashboard until it finishes or
/// `cancel` fires.
pub async fn drive<S, W, E>(
    session: &mut S,
    job: JobDescriptor,
    settings: &Settings,
    cancel: &CancellationToken,
    out: W,
    errors: E,
) -> Result<LoopState, Error>
where
    S: Session,
    W: Write,
    E: Write,
{
    log::info!("adding {} ({})", job.name(), job.info_hash());
    let handle = session.add_job(job, &settings.save_dir)?;
    handle.set_sequential(settings.sequential);
    let mut poll = PollLoop::new(session, &handle, &settings.render, out, errors);
    poll.run(cancel).await
}

pub async fn run(settings: Settings) -> Result<LoopState, Error> {
    let job = JobDescriptor::from_input(&settings.input)?;
    let mut session = SwarmSession::new(settings.swarm.clone())
        .map_err(|err| Error::Rejected(format!("{:#}", err)))?;

    let cancel = CancellationToken::new();
    interrupt::install(cancel.clone());
    drive(
        &mut session,
        job,
        &settings,
        &cancel,
        io::stdout(),
        io::stderr(),
    )
    .await
}
