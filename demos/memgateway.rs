//
//  Sample server on top of the in-memory gateway.
//
//  Listens on localhost:4918, plain http, no ssl.
//  Log in with basic auth as one of the users given with `-u`, any
//  password works. Try http://alice:x@localhost:4918/remote.php/webdav/
//
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use headers::{Authorization, HeaderMapExt, authorization::Basic};
use http::{Request, Response, StatusCode};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, task::spawn};

use dav_gateway::{
    DavHandler, GatewayClient,
    body::Body,
    gateway::Session,
    memgw::MemGateway,
    pool::GatewayPool,
    settings::Settings,
};

#[derive(Clone)]
struct Server {
    dh: DavHandler,
    gw: MemGateway,
}

impl Server {
    fn new(gw: MemGateway, settings: &Settings) -> Self {
        let config = DavHandler::builder()
            .gateway(GatewayPool::single(Box::new(gw.clone())))
            .data_client(Box::new(gw.clone()))
            .enable_http_tpc(true);
        Server {
            dh: settings.apply(config).build_handler(),
            gw,
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        // no credentials: public links and status.php only.
        let Some(Authorization(basic)) = req.headers().typed_get::<Authorization<Basic>>() else {
            return Ok(self.dh.handle(req).await);
        };
        match self.gw.authenticate("basic", basic.username(), basic.password()).await {
            Ok(auth) => {
                let session = Session::new(auth.user, auth.token);
                Ok(self.dh.handle_as(session, req).await)
            }
            Err(e) => {
                log::warn!("login of {} failed: {}", basic.username(), e);
                let mut res = Response::new(Body::from("please auth"));
                *res.status_mut() = StatusCode::UNAUTHORIZED;
                res.headers_mut().insert(
                    "WWW-Authenticate",
                    http::HeaderValue::from_static("Basic realm=\"memgateway\""),
                );
                Ok(res)
            }
        }
    }
}

#[derive(Debug, clap::Parser)]
#[clap(about, version)]
struct Cli {
    /// port to listen on
    #[clap(short = 'p', long, default_value = "4918")]
    port: u16,
    /// user to create, can be repeated
    #[clap(short = 'u', long = "user", default_value = "alice")]
    users: Vec<String>,
    /// share the home of the first user as a public link with this token
    #[clap(long)]
    public_link: Option<String>,
    /// settings file (toml)
    #[clap(short = 'c', long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Cli::parse();
    let settings = match args.config {
        Some(ref path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let gw = MemGateway::new();
    for name in &args.users {
        gw.add_user(name);
        gw.put_file(&format!("/users/{}/welcome.txt", name), b"hello\n");
    }
    if let (Some(token), Some(first)) = (args.public_link.as_ref(), args.users.first()) {
        gw.add_public_link(token, &format!("/users/{}", first), None);
    }

    let server = Server::new(gw, &settings);
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = TcpListener::bind(addr).await?;
    println!("Serving users {:?} on {}", args.users, addr);

    loop {
        let (stream, _client_addr) = listener.accept().await?;
        let server = server.clone();
        let io = TokioIo::new(stream);
        spawn(async move {
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { server.handle(req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("Failed serving: {err:?}");
            }
        });
    }
}
