//! OAuth2-shaped login flow with a provider submodule.
//!
//! The base module declares the callback route and its contract. The
//! `github` submodule only supplies configuration and the profile lookup.

use musubi::prelude::*;
use musubi::{save_then, MemorySession, NEXT, REQUEST, RESPONSE};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct Request {
    query: String,
    session: Arc<MemorySession>,
}

#[derive(Clone, Default)]
struct Response {
    location: Arc<Mutex<Option<String>>>,
}

fn oauth2() -> Result<Module, WorkflowError> {
    let module = Module::new("oauth2");
    module
        .declare_configurable("appId", "client id issued by the provider")
        .declare_configurable("authorizePath", "where users are sent to log in")
        .set_timeout(Some(Duration::from_secs(2)));

    module
        .declare_route(Method::Get, "callbackPath")
        .step("readCode")
        .accepts([REQUEST, RESPONSE, NEXT])
        .promises(["code"])
        .step("exchangeCode")
        .accepts(["code"])
        .promises(["accessToken"])
        .step("fetchProfile")
        .accepts(["accessToken"])
        .promises(["user"])
        .timeout(Duration::from_millis(500))
        .step("remember")
        .accepts([REQUEST, "user"])
        .promises(["login"])
        .step("finish")
        .accepts([RESPONSE, "login"])
        .promises(Vec::<String>::new())
        .can_break_to(["denied"])
        .commit()?;

    module
        .declare_sequence("denied")
        .step("sendBack")
        .accepts(["reason"])
        .promises(Vec::<String>::new())
        .commit()?;

    module
        .handle("readCode", |module, args| {
            let req = args.arg::<Request>(0)?;
            match req.query.strip_prefix("code=") {
                Some(code) => Ok(Outcome::value(code.to_string())),
                None => module.break_to("denied", vec![value(req.query)]),
            }
        })
        .handle("exchangeCode", |module, args| {
            let code = args.arg::<String>(0)?;
            let app_id = module.get::<String>("appId")?;
            Ok(Continuation::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(vec![value(format!("{app_id}:{code}"))])
            })
            .into())
        })
        .handle("fetchProfile", |_, _| {
            Err(WorkflowError::Configuration(
                "providers must supply fetchProfile".to_string(),
            ))
        })
        .handle_typed("remember", |module, (req, user): (Request, String), _| {
            req.session.set(module.name(), value(user.clone()));
            Ok(save_then(req.session, vec![value(user)]).into())
        })
        .handle("finish", |module, args| {
            let res = args.raw(0).cloned().ok_or("missing response")?;
            let login = args.arg::<String>(1)?;
            module.redirect(&res, &format!("/welcome/{login}"))?;
            Ok(Outcome::Done)
        })
        .handle("sendBack", |module, args| {
            let reason = args.arg::<String>(0)?;
            tracing::warn!(module = %module.name(), %reason, "login denied");
            Ok(Outcome::Done)
        })
        .redirect_with(|res, location| {
            let res = musubi::downcast::<Response>(res).ok_or("response is not a Response")?;
            if let Ok(mut slot) = res.location.lock() {
                *slot = Some(location.to_string());
            }
            Ok(())
        });

    Ok(module)
}

fn github(base: &Module) -> Result<Module, WorkflowError> {
    let github = base.create_submodule("github");
    github
        .set("appId", "gh-client".to_string())?
        .set("callbackPath", "/auth/github/callback".to_string())?;
    github.handle("fetchProfile", |_, args| {
        let token = args.arg::<String>(0)?;
        Ok(Continuation::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(vec![value(format!("octocat({token})"))])
        })
        .into())
    });
    Ok(github)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let base = oauth2()?;
    let github = github(&base)?;
    github.validate()?;

    for route in github.routes() {
        println!("{} {} -> {}", route.method(), route.path()?, route.sequence().name());
    }

    let route = github
        .route(Method::Get, "callbackPath")
        .ok_or("callback route missing")?;
    let session = Arc::new(MemorySession::new());
    let response = Response::default();
    let next = Next::new(|error| eprintln!("Login failed: {error}"));

    let request = Request {
        query: "code=abc123".to_string(),
        session: session.clone(),
    };
    let done = route.trigger(value(request), value(response.clone()), next.clone())?;
    match done.settled().await {
        Settled::Fulfilled(_) => {
            let location = response.location.lock().map(|l| l.clone()).unwrap_or_default();
            println!("Redirected to {location:?}, session saved {} time(s)", session.save_count());
        }
        Settled::Failed(error) => eprintln!("Flow failed: {error}"),
        Settled::TimedOut => eprintln!("Flow timed out"),
    }

    let denied = Request {
        query: "error=access_denied".to_string(),
        session,
    };
    route.trigger(value(denied), value(Response::default()), next)?;

    Ok(())
}
