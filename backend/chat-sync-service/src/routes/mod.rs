pub mod chats;
pub mod health;
pub mod media;
pub mod messages;
pub mod wsroute;

use actix_web::web;

/// Register every HTTP and WebSocket route of the service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health)
        .service(health::ping)
        .service(chats::list_chats)
        .service(chats::create_dialog)
        .service(chats::create_group)
        .service(chats::delete_chat)
        .service(messages::get_messages)
        .service(messages::sync_chat)
        .service(messages::send_message)
        .service(messages::edit_message)
        .service(messages::mark_read)
        .service(media::get_media)
        .service(wsroute::ws_handler);
}
